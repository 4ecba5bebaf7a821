//! Simulation configuration.
//!
//! All tunables live here and are handed to the engine by reference;
//! nothing reads configuration through globals.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub world: WorldConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub decay: DecayConfig,
    #[serde(default)]
    pub pellet: PelletConfig,
    #[serde(default)]
    pub virus: VirusConfig,
    #[serde(default)]
    pub eject: EjectConfig,
    #[serde(default)]
    pub eat: EatConfig,
}

impl Config {
    /// Load configuration from `config.toml` or use defaults.
    pub fn load() -> anyhow::Result<Self> {
        let path = Path::new("config.toml");
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            info!("No config.toml found, creating default config");
            let default_config = Self::default();
            std::fs::write(path, toml::to_string_pretty(&default_config)?)?;
            Ok(default_config)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            world: WorldConfig::default(),
            player: PlayerConfig::default(),
            decay: DecayConfig::default(),
            pellet: PelletConfig::default(),
            virus: VirusConfig::default(),
            eject: EjectConfig::default(),
            eat: EatConfig::default(),
        }
    }
}

/// Tick loop and threading settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Worker threads for the parallel tick phases.
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Tick interval in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Cells spawned (pellets plus viruses) per tick at most.
    #[serde(default = "default_max_spawn_per_tick")]
    pub max_spawn_per_tick: usize,
    /// Attempts before giving up on a safe spawn position.
    #[serde(default = "default_safe_spawn_tries")]
    pub safe_spawn_tries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            tick_interval_ms: default_tick_interval(),
            max_spawn_per_tick: default_max_spawn_per_tick(),
            safe_spawn_tries: default_safe_spawn_tries(),
        }
    }
}

fn default_threads() -> usize {
    4
}
fn default_tick_interval() -> u64 {
    50
}
fn default_max_spawn_per_tick() -> usize {
    50
}
fn default_safe_spawn_tries() -> usize {
    128
}

/// World bounds and spatial index tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorldConfig {
    #[serde(default = "default_map_half")]
    pub half_width: f32,
    #[serde(default = "default_map_half")]
    pub half_height: f32,
    #[serde(default = "default_quadtree_max_level")]
    pub quadtree_max_level: u32,
    #[serde(default = "default_quadtree_max_items")]
    pub quadtree_max_items: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            half_width: default_map_half(),
            half_height: default_map_half(),
            quadtree_max_level: default_quadtree_max_level(),
            quadtree_max_items: default_quadtree_max_items(),
        }
    }
}

fn default_map_half() -> f32 {
    // Coordinates are reported as signed shorts; keep within 32767.
    20000.0
}
fn default_quadtree_max_level() -> u32 {
    16
}
fn default_quadtree_max_items() -> usize {
    24
}

/// Player cell configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlayerConfig {
    #[serde(default = "default_spawn_size")]
    pub spawn_size: f32,
    #[serde(default = "default_max_cells")]
    pub max_cells: usize,
    /// Speed multiplier applied on top of the size-based curve.
    #[serde(default = "default_player_speed")]
    pub speed: f32,
    #[serde(default = "default_min_split_size")]
    pub min_split_size: f32,
    #[serde(default = "default_min_eject_size")]
    pub min_eject_size: f32,
    #[serde(default = "default_split_boost")]
    pub split_boost: f32,
    /// Offset of a split piece from its parent's center.
    #[serde(default = "default_split_dist")]
    pub split_dist: f32,
    /// Pieces produced by a single split command at most.
    #[serde(default = "default_split_cap")]
    pub split_cap: usize,
    #[serde(default = "default_autosplit_size")]
    pub autosplit_size: f32,
    /// Milliseconds between the oversize latch and the actual split.
    #[serde(default = "default_autosplit_delay")]
    pub autosplit_delay: f32,
    /// Minimum age in milliseconds before two pieces may merge.
    #[serde(default = "default_no_merge_delay")]
    pub no_merge_delay: f32,
    /// Minimum age in milliseconds before own pieces collide.
    #[serde(default = "default_no_colli_delay")]
    pub no_colli_delay: f32,
    /// Base merge age floor in milliseconds.
    #[serde(default = "default_merge_initial")]
    pub merge_initial: f32,
    /// Scale on the size-proportional merge age requirement.
    #[serde(default = "default_merge_increase")]
    pub merge_increase: f32,
    #[serde(default = "default_view_scale")]
    pub view_scale: f32,
    #[serde(default = "default_view_min")]
    pub view_min: f32,
    /// Milliseconds a dead cell lingers before despawning.
    #[serde(default = "default_dead_delay")]
    pub dead_delay: f32,
    /// Safe spawn clearance as a multiple of the spawn radius.
    #[serde(default = "default_player_safe_spawn_radius")]
    pub safe_spawn_radius: f32,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            spawn_size: default_spawn_size(),
            max_cells: default_max_cells(),
            speed: default_player_speed(),
            min_split_size: default_min_split_size(),
            min_eject_size: default_min_eject_size(),
            split_boost: default_split_boost(),
            split_dist: default_split_dist(),
            split_cap: default_split_cap(),
            autosplit_size: default_autosplit_size(),
            autosplit_delay: default_autosplit_delay(),
            no_merge_delay: default_no_merge_delay(),
            no_colli_delay: default_no_colli_delay(),
            merge_initial: default_merge_initial(),
            merge_increase: default_merge_increase(),
            view_scale: default_view_scale(),
            view_min: default_view_min(),
            dead_delay: default_dead_delay(),
            safe_spawn_radius: default_player_safe_spawn_radius(),
        }
    }
}

fn default_spawn_size() -> f32 {
    32.0
}
fn default_max_cells() -> usize {
    16
}
fn default_player_speed() -> f32 {
    1.5
}
fn default_min_split_size() -> f32 {
    60.0
}
fn default_min_eject_size() -> f32 {
    60.0
}
fn default_split_boost() -> f32 {
    800.0
}
fn default_split_dist() -> f32 {
    40.0
}
fn default_split_cap() -> usize {
    4
}
fn default_autosplit_size() -> f32 {
    1500.0
}
fn default_autosplit_delay() -> f32 {
    100.0
}
fn default_no_merge_delay() -> f32 {
    650.0
}
fn default_no_colli_delay() -> f32 {
    650.0
}
fn default_merge_initial() -> f32 {
    1000.0
}
fn default_merge_increase() -> f32 {
    1.0
}
fn default_view_scale() -> f32 {
    1.0
}
fn default_view_min() -> f32 {
    4000.0
}
fn default_dead_delay() -> f32 {
    5000.0
}
fn default_player_safe_spawn_radius() -> f32 {
    1.5
}

/// Mass decay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecayConfig {
    #[serde(default = "default_static_decay")]
    pub static_decay: f32,
    #[serde(default = "default_dynamic_decay")]
    pub dynamic_decay: f32,
    /// Radius below which no passive decay applies.
    #[serde(default = "default_decay_min")]
    pub decay_min: f32,
    /// Fraction of remaining boost shed per millisecond.
    #[serde(default = "default_boost_decay")]
    pub boost_decay: f32,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            static_decay: default_static_decay(),
            dynamic_decay: default_dynamic_decay(),
            decay_min: default_decay_min(),
            boost_decay: default_boost_decay(),
        }
    }
}

fn default_static_decay() -> f32 {
    1.0
}
fn default_dynamic_decay() -> f32 {
    1.0
}
fn default_decay_min() -> f32 {
    1000.0
}
fn default_boost_decay() -> f32 {
    0.0025
}

/// Pellet configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PelletConfig {
    #[serde(default = "default_pellet_count")]
    pub count: usize,
    #[serde(default = "default_pellet_size")]
    pub size: f32,
}

impl Default for PelletConfig {
    fn default() -> Self {
        Self {
            count: default_pellet_count(),
            size: default_pellet_size(),
        }
    }
}

fn default_pellet_count() -> usize {
    1000
}
fn default_pellet_size() -> f32 {
    10.0
}

/// Virus configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VirusConfig {
    #[serde(default = "default_virus_count")]
    pub count: usize,
    #[serde(default = "default_virus_size")]
    pub size: f32,
    /// Ejected cells absorbed before the virus splits itself.
    #[serde(default = "default_virus_feed_times")]
    pub feed_times: usize,
    /// Whether fed viruses are pushed instead of splitting.
    #[serde(default)]
    pub push: bool,
    #[serde(default = "default_virus_push_boost")]
    pub push_boost: f32,
    #[serde(default = "default_virus_split_boost")]
    pub split_boost: f32,
    #[serde(default = "default_virus_max_boost")]
    pub max_boost: f32,
    /// Safe spawn clearance as a multiple of the virus radius.
    #[serde(default = "default_virus_safe_spawn_radius")]
    pub safe_spawn_radius: f32,
}

impl VirusConfig {
    /// Radius at which a fed virus splits: its own mass plus the mass
    /// of `feed_times` ejected cells.
    pub fn max_size(&self, eject: &EjectConfig) -> f32 {
        (self.size * self.size + eject.size * eject.size * self.feed_times as f32).sqrt()
    }
}

impl Default for VirusConfig {
    fn default() -> Self {
        Self {
            count: default_virus_count(),
            size: default_virus_size(),
            feed_times: default_virus_feed_times(),
            push: false,
            push_boost: default_virus_push_boost(),
            split_boost: default_virus_split_boost(),
            max_boost: default_virus_max_boost(),
            safe_spawn_radius: default_virus_safe_spawn_radius(),
        }
    }
}

fn default_virus_count() -> usize {
    30
}
fn default_virus_size() -> f32 {
    100.0
}
fn default_virus_feed_times() -> usize {
    20
}
fn default_virus_push_boost() -> f32 {
    780.0
}
fn default_virus_split_boost() -> f32 {
    120.0
}
fn default_virus_max_boost() -> f32 {
    1000.0
}
fn default_virus_safe_spawn_radius() -> f32 {
    3.0
}

/// Ejected mass configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EjectConfig {
    #[serde(default = "default_eject_size")]
    pub size: f32,
    /// Radius removed from the ejecting cell.
    #[serde(default = "default_eject_loss")]
    pub loss: f32,
    #[serde(default = "default_eject_boost")]
    pub boost: f32,
    /// Random angular spread applied to the eject direction.
    #[serde(default = "default_eject_dispersion")]
    pub dispersion: f32,
    /// Milliseconds between ejects from one player.
    #[serde(default = "default_eject_delay")]
    pub delay: f32,
    /// Minimum cell age in milliseconds before it may eject.
    #[serde(default = "default_eject_min_age")]
    pub min_age: f32,
    /// Milliseconds before an ejected cell despawns.
    #[serde(default = "default_eject_max_age")]
    pub max_age: f32,
}

impl Default for EjectConfig {
    fn default() -> Self {
        Self {
            size: default_eject_size(),
            loss: default_eject_loss(),
            boost: default_eject_boost(),
            dispersion: default_eject_dispersion(),
            delay: default_eject_delay(),
            min_age: default_eject_min_age(),
            max_age: default_eject_max_age(),
        }
    }
}

fn default_eject_size() -> f32 {
    38.0
}
fn default_eject_loss() -> f32 {
    43.0
}
fn default_eject_boost() -> f32 {
    780.0
}
fn default_eject_dispersion() -> f32 {
    0.3
}
fn default_eject_delay() -> f32 {
    100.0
}
fn default_eject_min_age() -> f32 {
    200.0
}
fn default_eject_max_age() -> f32 {
    10000.0
}

/// Eat rule thresholds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EatConfig {
    /// Required overlap depth: eat when `d < r1 - r2 / overlap`.
    #[serde(default = "default_eat_overlap")]
    pub overlap: f32,
    /// Required size ratio between eater and eaten.
    #[serde(default = "default_eat_mult")]
    pub mult: f32,
}

impl Default for EatConfig {
    fn default() -> Self {
        Self {
            overlap: default_eat_overlap(),
            mult: default_eat_mult(),
        }
    }
}

fn default_eat_overlap() -> f32 {
    3.0
}
fn default_eat_mult() -> f32 {
    1.140175425099138
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.world.half_width, config.world.half_width);
        assert_eq!(parsed.player.max_cells, config.player.max_cells);
        assert_eq!(parsed.eat.mult, config.eat.mult);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let parsed: Config = toml::from_str("[player]\nmax_cells = 8\n").unwrap();
        assert_eq!(parsed.player.max_cells, 8);
        assert_eq!(parsed.player.spawn_size, default_spawn_size());
        assert_eq!(parsed.virus.count, default_virus_count());
    }

    #[test]
    fn virus_max_size_accounts_for_feed_mass() {
        let config = Config::default();
        let max = config.virus.max_size(&config.eject);
        let expected =
            (100.0f32 * 100.0 + 38.0 * 38.0 * 20.0).sqrt();
        assert!((max - expected).abs() < 1e-3);
    }
}
