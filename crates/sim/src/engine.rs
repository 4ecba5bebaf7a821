//! The physics tick engine.
//!
//! One tick runs six strictly ordered phases over the arena:
//! cleanup of last tick's removals, sequential movement and decay,
//! parallel broad-phase candidate gathering, parallel narrow-phase
//! resolution, sequential merge-eligibility, and sequential
//! post-resolution (removals, pops, autosplits, index relocation).
//! Only phases 3 and 4 run on the worker pool; every pair touched
//! there is mutated under the arena's pair lock, so two shards can
//! never write the same cell concurrently.

use std::collections::HashMap;
use std::f32::consts::{FRAC_1_SQRT_2, TAU};
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

use glam::Vec2;
use rand::Rng;
use tracing::{debug, warn};

use crate::arena::{
    flags, is_player_type, Arena, ArenaError, Boost, CellId, DEAD_TYPE, EJECTED_TYPE, MOTHER_TYPE,
    PELLET_TYPE, VIRUS_TYPE,
};
use crate::config::Config;
use crate::pool::WorkerPool;
use crate::spatial::{Circle, QuadTree, Rect, Shape};

pub type PlayerId = u8;

/// Milliseconds after a virus pop during which a player cannot eject.
const NO_EJECT_POP_DELAY: f32 = 500.0;

/// Per-player input and bookkeeping state.
#[derive(Debug, Clone)]
pub struct PlayerControl {
    pub mouse_x: f32,
    pub mouse_y: f32,
    pub split_attempts: u8,
    pub eject_attempts: u8,
    pub eject_macro: bool,
    /// When set, cells move along the line `ax + by + c = 0` instead
    /// of freely toward the mouse.
    pub lock_dir: bool,
    pub line_a: f32,
    pub line_b: f32,
    pub line_c: f32,
    pub score: f32,
    pub kills: u32,
    pub spawn_requested: bool,
    next_eject_at: f32,
    popped_at: f32,
}

impl Default for PlayerControl {
    fn default() -> Self {
        Self {
            mouse_x: 0.0,
            mouse_y: 0.0,
            split_attempts: 0,
            eject_attempts: 0,
            eject_macro: false,
            lock_dir: false,
            line_a: 0.0,
            line_b: 0.0,
            line_c: 0.0,
            score: 0.0,
            kills: 0,
            spawn_requested: false,
            next_eject_at: 0.0,
            popped_at: f32::MIN,
        }
    }
}

/// What one tick did, surfaced to the driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    pub cells: usize,
    pub collisions: u32,
    pub spawned: u32,
    pub removed: u32,
    /// The arena ran out of slots; spawning was skipped this tick.
    pub arena_exhausted: bool,
}

pub struct Engine {
    config: Config,
    arena: Arena,
    tree: QuadTree,
    pool: WorkerPool,
    /// Live cell ids bucketed by type tag; positions kept in
    /// `group_pos` for O(1) removal.
    groups: Vec<Vec<CellId>>,
    group_pos: Box<[u32]>,
    players: HashMap<PlayerId, PlayerControl>,
    /// Slots retired last tick, zeroed at the start of the next one
    /// so `eaten_by` stays readable for the encoders in between.
    removed: Vec<CellId>,
    active: Vec<CellId>,
    clock: f32,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let bounds = Rect::new(
            0.0,
            0.0,
            config.world.half_width,
            config.world.half_height,
        );
        let tree = QuadTree::new(
            bounds,
            config.world.quadtree_max_level,
            config.world.quadtree_max_items,
        );
        let pool = WorkerPool::new(config.engine.threads);
        Self {
            config,
            arena: Arena::new(),
            tree,
            pool,
            groups: vec![Vec::new(); 256],
            group_pos: vec![0u32; crate::arena::CELL_CAPACITY].into_boxed_slice(),
            players: HashMap::new(),
            removed: Vec::new(),
            active: Vec::new(),
            clock: 0.0,
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub fn cell_count(&self) -> usize {
        self.arena.len()
    }

    // ---- player management ------------------------------------------------

    /// Registers a player slot. Returns false if the id is taken.
    pub fn add_player(&mut self, id: PlayerId) -> bool {
        if self.players.contains_key(&id) {
            return false;
        }
        self.players.insert(id, PlayerControl::default());
        true
    }

    /// Drops a player, marking their cells for removal next tick.
    pub fn remove_player(&mut self, id: PlayerId) {
        self.kill_player(id, false);
        self.players.remove(&id);
    }

    pub fn control(&self, id: PlayerId) -> Option<&PlayerControl> {
        self.players.get(&id)
    }

    pub fn control_mut(&mut self, id: PlayerId) -> Option<&mut PlayerControl> {
        self.players.get_mut(&id)
    }

    pub fn is_alive(&self, id: PlayerId) -> bool {
        !self.groups[id as usize].is_empty()
    }

    pub fn own_cell_count(&self, id: PlayerId) -> usize {
        self.groups[id as usize].len()
    }

    pub fn request_spawn(&mut self, id: PlayerId) {
        if let Some(control) = self.players.get_mut(&id) {
            control.spawn_requested = true;
        }
    }

    pub fn set_mouse(&mut self, id: PlayerId, x: f32, y: f32) {
        if let Some(control) = self.players.get_mut(&id) {
            control.mouse_x = x;
            control.mouse_y = y;
        }
    }

    pub fn split(&mut self, id: PlayerId) {
        if let Some(control) = self.players.get_mut(&id) {
            control.split_attempts = control.split_attempts.saturating_add(1);
        }
    }

    pub fn eject(&mut self, id: PlayerId) {
        if let Some(control) = self.players.get_mut(&id) {
            control.eject_attempts = control.eject_attempts.saturating_add(1);
        }
    }

    /// Locks the player's movement to the line `ax + by + c = 0`.
    pub fn lock_line(&mut self, id: PlayerId, a: f32, b: f32, c: f32) {
        if let Some(control) = self.players.get_mut(&id) {
            control.lock_dir = true;
            control.line_a = a;
            control.line_b = b;
            control.line_c = c;
        }
    }

    pub fn unlock_line(&mut self, id: PlayerId) {
        if let Some(control) = self.players.get_mut(&id) {
            control.lock_dir = false;
        }
    }

    /// Kills every cell of a player. With `replace` each cell leaves a
    /// short-lived Dead tombstone in a fresh slot so `eaten_by`
    /// references stay valid; without it the cells are simply marked
    /// for removal.
    pub fn kill_player(&mut self, id: PlayerId, replace: bool) {
        let cells = self.groups[id as usize].clone();
        for cell_id in cells {
            if replace {
                let circle = self.tree.circle(cell_id);
                match self.arena.tombstone(cell_id) {
                    Ok(new_id) => {
                        self.group_remove(cell_id, id);
                        self.tree.remove(cell_id);
                        self.tree.insert(new_id, circle);
                        self.group_add(new_id, DEAD_TYPE);
                    }
                    Err(ArenaError::Exhausted) => {
                        // No slot for a tombstone; fall back to a
                        // plain removal next tick.
                        self.arena.cell_mut(cell_id).set(flags::REMOVED);
                    }
                }
            } else {
                self.arena.cell_mut(cell_id).set(flags::REMOVED);
            }
        }
        if let Some(control) = self.players.get_mut(&id) {
            control.score = 0.0;
        }
    }

    /// Players ranked by score, best first.
    pub fn leaderboard(&self) -> Vec<(PlayerId, f32)> {
        let mut board: Vec<(PlayerId, f32)> =
            self.players.iter().map(|(&id, c)| (id, c.score)).collect();
        board.sort_by(|a, b| b.1.total_cmp(&a.1));
        board
    }

    // ---- view-facing queries ----------------------------------------------

    /// Every cell visible in a viewport rectangle. Pellets younger
    /// than a millisecond are withheld so a viewer never sees a
    /// pellet the same tick it was placed.
    pub fn query_viewport<F: FnMut(CellId)>(&self, view: Rect, mut f: F) {
        self.tree.query(&Shape::Rect(view), |id| {
            let cell = self.arena.cell(id);
            if cell.cell_type == PELLET_TYPE && cell.age <= 1.0 {
                return;
            }
            f(id);
        });
    }

    /// Viewport centered on the player's cells, scaled with score.
    pub fn player_viewport(&self, id: PlayerId) -> Rect {
        let group = &self.groups[id as usize];
        if group.is_empty() {
            return Rect::new(0.0, 0.0, self.config.player.view_min, self.config.player.view_min);
        }
        let mut cx = 0.0;
        let mut cy = 0.0;
        for &cell_id in group {
            cx += self.arena.x(cell_id);
            cy += self.arena.y(cell_id);
        }
        let n = group.len() as f32;
        let score = self.players.get(&id).map_or(0.0, |c| c.score);
        let half = (self.config.player.view_scale * 10.0 * (score * 100.0).sqrt())
            .max(self.config.player.view_min);
        Rect::new(cx / n, cy / n, half, half)
    }

    // ---- the tick ---------------------------------------------------------

    /// Advances the simulation by `dt` milliseconds.
    pub fn tick(&mut self, dt: f32) -> TickStats {
        let start = std::time::Instant::now();
        let mut stats = TickStats::default();
        self.clock += dt;

        self.cleanup();
        self.spawn_cells(&mut stats);
        self.handle_inputs(dt, &mut stats);
        self.update_cells(dt);
        self.move_player_cells(dt);
        stats.collisions = self.resolve_parallel();
        self.update_merge_and_scores();
        self.post_resolution(&mut stats);
        self.tree.post_tick();

        stats.cells = self.arena.len();
        debug!(
            cells = stats.cells,
            collisions = stats.collisions,
            nodes = self.tree.node_count(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "tick"
        );
        stats
    }

    /// Phase 1: zero the slots retired by last tick's post-resolution.
    fn cleanup(&mut self) {
        for id in std::mem::take(&mut self.removed) {
            self.arena.free(id);
        }
    }

    /// Pre-phase: top up pellets and viruses, then place requested
    /// player spawns. All spawning stops for the tick once the arena
    /// reports exhaustion.
    fn spawn_cells(&mut self, stats: &mut TickStats) {
        let pellet_size = self.config.pellet.size;
        let pellet_count = self.config.pellet.count;
        let mut budget = self.config.engine.max_spawn_per_tick;
        while budget > 0
            && self.groups[PELLET_TYPE as usize].len() < pellet_count
            && !stats.arena_exhausted
        {
            let (x, y) = self.random_point(pellet_size);
            self.try_new_cell(PELLET_TYPE, x, y, pellet_size, Boost::default(), stats);
            budget -= 1;
        }

        let virus_size = self.config.virus.size;
        let virus_count = self.config.virus.count;
        let virus_clearance = virus_size * self.config.virus.safe_spawn_radius;
        let mut budget = self.config.engine.max_spawn_per_tick;
        while budget > 0
            && self.groups[VIRUS_TYPE as usize].len() < virus_count
            && !stats.arena_exhausted
        {
            if let Some((x, y)) = self.safe_point(virus_clearance) {
                self.try_new_cell(VIRUS_TYPE, x, y, virus_size, Boost::default(), stats);
            }
            budget -= 1;
        }

        let spawn_size = self.config.player.spawn_size;
        let clearance = spawn_size * self.config.player.safe_spawn_radius;
        let pending: Vec<PlayerId> = self
            .players
            .iter()
            .filter(|&(&id, c)| c.spawn_requested && self.groups[id as usize].is_empty())
            .map(|(&id, _)| id)
            .collect();
        for id in pending {
            if stats.arena_exhausted {
                break;
            }
            if let Some((x, y)) = self.safe_point(clearance) {
                if self
                    .try_new_cell(id, x, y, spawn_size, Boost::default(), stats)
                    .is_some()
                {
                    if let Some(control) = self.players.get_mut(&id) {
                        control.spawn_requested = false;
                        control.popped_at = f32::MIN;
                    }
                }
            }
        }
    }

    /// Pre-phase: consume split and eject commands.
    fn handle_inputs(&mut self, dt: f32, stats: &mut TickStats) {
        let ids: Vec<PlayerId> = self.players.keys().copied().collect();
        let max_cells = self.config.player.max_cells;
        let min_split = self.config.player.min_split_size;
        let split_boost = self.config.player.split_boost;
        let split_cap = self.config.player.split_cap;
        let eject = self.config.eject.clone();

        for id in ids {
            let control = &self.players[&id];
            let (mouse_x, mouse_y) = (control.mouse_x, control.mouse_y);
            let mut split_attempts = control.split_attempts;
            let mut eject_attempts = control.eject_attempts;
            let eject_macro = control.eject_macro;
            let popped_at = control.popped_at;
            let mut next_eject_at = control.next_eject_at;

            // Splits, capped per tick.
            let mut cap = split_cap;
            while split_attempts > 0 && cap > 0 {
                split_attempts -= 1;
                cap -= 1;
                let cells = self.groups[id as usize].clone();
                for cell_id in cells {
                    if self.groups[id as usize].len() >= max_cells {
                        break;
                    }
                    let cell = *self.arena.cell_mut(cell_id);
                    if cell.r < min_split {
                        continue;
                    }
                    let to_mouse = Vec2::new(mouse_x - cell.x, mouse_y - cell.y);
                    let dir = if to_mouse.length() < 1.0 {
                        Vec2::X
                    } else {
                        to_mouse.normalize()
                    };
                    self.split_from_cell(cell_id, cell.r * FRAC_1_SQRT_2, dir, split_boost, stats);
                }
            }

            // Ejects, rate-limited by the eject delay and suppressed
            // briefly after a virus pop.
            if self.clock > popped_at + NO_EJECT_POP_DELAY {
                let mut budget = (dt / eject.delay).ceil() as u32;
                while next_eject_at <= self.clock + dt
                    && (eject_attempts > 0 || eject_macro)
                    && budget > 0
                {
                    budget -= 1;
                    eject_attempts = eject_attempts.saturating_sub(1);
                    let cells = self.groups[id as usize].clone();
                    for cell_id in cells {
                        let cell = *self.arena.cell_mut(cell_id);
                        if cell.r < self.config.player.min_eject_size
                            || cell.age < eject.min_age
                        {
                            continue;
                        }
                        let to_mouse = Vec2::new(mouse_x - cell.x, mouse_y - cell.y);
                        let dir = if to_mouse.length() < 1.0 {
                            Vec2::X
                        } else {
                            to_mouse.normalize()
                        };
                        let sx = cell.x + dir.x * cell.r;
                        let sy = cell.y + dir.y * cell.r;
                        let mut rng = rand::rng();
                        let angle = dir.x.atan2(dir.y)
                            + rng.random_range(-eject.dispersion..eject.dispersion);
                        let boost = Boost {
                            dx: angle.sin(),
                            dy: angle.cos(),
                            d: eject.boost,
                        };
                        if self
                            .try_new_cell(EJECTED_TYPE, sx, sy, eject.size, boost, stats)
                            .is_some()
                        {
                            let parent = self.arena.cell_mut(cell_id);
                            parent.r = (parent.r * parent.r - eject.loss * eject.loss)
                                .max(0.0)
                                .sqrt();
                            parent.set(flags::UPDATED);
                        }
                    }
                    next_eject_at = self.clock + eject.delay;
                }
            }

            if let Some(control) = self.players.get_mut(&id) {
                control.split_attempts = split_attempts;
                control.eject_attempts = eject_attempts;
                control.next_eject_at = next_eject_at;
            }
        }
    }

    /// Phase 2, general pass: age, flag clearing, boost movement,
    /// passive decay, the autosplit latch, and boundary clamping.
    fn update_cells(&mut self, dt: f32) {
        // MERGE survives the per-tick clear; eligibility is recomputed
        // in its own phase after resolution.
        let retain = flags::CLEAR_MASK | flags::MERGE;
        let boost_decay = self.config.decay.boost_decay;
        let eject_max_age = self.config.eject.max_age;
        let auto_size = self.config.player.autosplit_size;
        let decay_min = self.config.decay.decay_min;
        let static_decay = self.config.decay.static_decay * 0.01;
        let dynamic_decay = self.config.decay.dynamic_decay;
        let (l, r_edge) = (-self.config.world.half_width, self.config.world.half_width);
        let (b, t) = (-self.config.world.half_height, self.config.world.half_height);

        for type_tag in 0..=255u8 {
            let multi = if is_player_type(type_tag) {
                let score = self.players.get(&type_tag).map_or(0.0, |c| c.score);
                ((score - 0.01 * decay_min * decay_min) * 0.00005 * dynamic_decay).max(1.0)
            } else {
                1.0
            };
            for i in 0..self.groups[type_tag as usize].len() {
                let id = self.groups[type_tag as usize][i];
                let cell = self.arena.cell_mut(id);
                cell.age += dt;
                cell.flags &= retain;

                if cell.cell_type == EJECTED_TYPE
                    && eject_max_age > 0.0
                    && cell.age > eject_max_age
                {
                    cell.set(flags::REMOVED);
                }

                if cell.boost.d > 1.0 {
                    let db = cell.boost.d * boost_decay * dt;
                    cell.x += cell.boost.dx * db;
                    cell.y += cell.boost.dy * db;
                    if !cell.is_player() {
                        cell.set(flags::UPDATED);
                    }
                    cell.boost.d -= db;
                } else {
                    cell.boost.d = 1.0;
                }

                if cell.is_player() {
                    if cell.r > decay_min {
                        cell.r -= multi * cell.r * static_decay * dt * 0.0001;
                    }
                    if auto_size > 0.0 && cell.r > auto_size && !cell.has(flags::AUTOSPLIT) {
                        cell.set(flags::AUTOSPLIT);
                        cell.age = 0.0;
                    }
                }

                let bounce = cell.boost.d > 1.0;
                let cr = cell.r;
                if cell.x < l + cr {
                    cell.x = l + cr;
                    cell.set(flags::UPDATED);
                    if bounce {
                        cell.boost.dx = -cell.boost.dx;
                    }
                } else if cell.x > r_edge - cr {
                    cell.x = r_edge - cr;
                    cell.set(flags::UPDATED);
                    if bounce {
                        cell.boost.dx = -cell.boost.dx;
                    }
                }
                if cell.y > t - cr {
                    cell.y = t - cr;
                    cell.set(flags::UPDATED);
                    if bounce {
                        cell.boost.dy = -cell.boost.dy;
                    }
                } else if cell.y < b + cr {
                    cell.y = b + cr;
                    cell.set(flags::UPDATED);
                    if bounce {
                        cell.boost.dy = -cell.boost.dy;
                    }
                }
            }
        }
    }

    /// Phase 2, steering pass: player cells chase the mouse at a
    /// radius-dependent speed, clamped so a cell never overshoots its
    /// target within one tick.
    fn move_player_cells(&mut self, dt: f32) {
        let speed_mult = self.config.player.speed;
        let ids: Vec<PlayerId> = self.players.keys().copied().collect();
        for id in ids {
            let control = &self.players[&id];
            let (mouse_x, mouse_y) = (control.mouse_x, control.mouse_y);
            let lock_dir = control.lock_dir;
            let (la, lb, lc) = (control.line_a, control.line_b, control.line_c);

            let mut wall_touched = false;
            for i in 0..self.groups[id as usize].len() {
                let cell_id = self.groups[id as usize][i];
                let cell = self.arena.cell_mut(cell_id);
                let speed = 1.76 * cell.r.powf(-0.4396754) * speed_mult;

                if lock_dir {
                    wall_touched |= cell.has(flags::UPDATED);
                    cell.set(flags::LOCKED);
                    let dx = mouse_x - cell.x;
                    let dy = mouse_y - cell.y;
                    let d = (dx * dx + dy * dy).sqrt();
                    if d < 1.0 {
                        continue;
                    }
                    let m = (speed * dt).min(d);
                    if la != 0.0 {
                        cell.y += dy / d * m;
                        cell.x = (-lc - lb * cell.y) / la;
                    } else if lb != 0.0 {
                        cell.x += dx / d * m;
                        cell.y = (-lc - la * cell.x) / lb;
                    }
                } else {
                    let dx = mouse_x - cell.x;
                    let dy = mouse_y - cell.y;
                    let d = (dx * dx + dy * dy).sqrt();
                    if d < 1.0 {
                        continue;
                    }
                    let m = (speed * dt).min(d);
                    cell.x += dx / d * m;
                    cell.y += dy / d * m;
                }
            }
            // A locked cell bouncing off the field boundary releases
            // the whole line lock.
            if lock_dir && wall_touched {
                if let Some(control) = self.players.get_mut(&id) {
                    control.lock_dir = false;
                }
            }
        }
    }

    /// Phases 3 and 4: broad-phase queries plus narrow-phase
    /// resolution, sharded across the worker pool.
    fn resolve_parallel(&mut self) -> u32 {
        self.active.clear();
        for type_tag in 0..=255u8 {
            if type_tag == PELLET_TYPE {
                continue;
            }
            self.active.extend_from_slice(&self.groups[type_tag as usize]);
        }
        if self.active.is_empty() {
            return 0;
        }

        let collisions = AtomicU32::new(0);
        let ctx = ResolveCtx {
            arena: &self.arena,
            tree: &self.tree,
            config: &self.config,
            virus_max_size: self.config.virus.max_size(&self.config.eject),
            virus_push_boost: if self.config.virus.push {
                self.config.virus.push_boost
            } else {
                0.0
            },
            collisions: &collisions,
        };
        let shard_size = self.active.len().div_ceil(self.pool.threads()).max(1);
        let active = &self.active;
        self.pool.scope(|scope| {
            for shard in active.chunks(shard_size) {
                let ctx = &ctx;
                scope.spawn(move || resolve_shard(ctx, shard));
            }
        });
        collisions.load(Relaxed)
    }

    /// Phase 5: recompute merge eligibility and scores per player.
    /// Bigger pieces take longer to become mergeable again.
    fn update_merge_and_scores(&mut self) {
        let merge_initial = self.config.player.merge_initial;
        let merge_increase = self.config.player.merge_increase;
        let no_merge_delay = self.config.player.no_merge_delay;
        for (&id, control) in self.players.iter_mut() {
            let mut score = 0.0;
            for i in 0..self.groups[id as usize].len() {
                let cell_id = self.groups[id as usize][i];
                let cell = self.arena.cell_mut(cell_id);
                score += cell.mass() * 0.01;
                let gate = (25.0 * cell.r * merge_increase).max(no_merge_delay);
                if cell.age > merge_initial && cell.age > gate {
                    cell.set(flags::MERGE);
                } else {
                    cell.clear(flags::MERGE);
                }
            }
            control.score = score;
        }
    }

    /// Phase 6: retire removed cells, execute deferred pops and
    /// autosplits, project line-locked cells back onto their line,
    /// and relocate every moved cell in the index.
    fn post_resolution(&mut self, stats: &mut TickStats) {
        let autosplit_delay = self.config.player.autosplit_delay;
        let snapshot: Vec<CellId> = self.groups.iter().flatten().copied().collect();
        for id in snapshot {
            let cell = *self.arena.cell_mut(id);
            if !cell.exists() {
                continue;
            }
            if cell.has(flags::REMOVED) {
                self.retire_cell(id);
                stats.removed += 1;
                continue;
            }
            if cell.has(flags::POP) {
                if cell.cell_type == VIRUS_TYPE {
                    self.split_virus(id, stats);
                } else if cell.is_player() {
                    self.pop_player(id, stats);
                }
                self.arena.cell_mut(id).clear(flags::POP);
            }
            if cell.is_player() && cell.has(flags::AUTOSPLIT) && cell.age > autosplit_delay {
                self.autosplit(id, stats);
                self.arena.cell_mut(id).clear(flags::AUTOSPLIT);
            }
            if cell.has(flags::LOCKED) {
                self.project_onto_line(id, cell.cell_type);
            }
            let cell = self.arena.cell_mut(id);
            if cell.is_player() || cell.flags & (flags::UPDATED | flags::AUTOSPLIT) != 0 {
                let circle = Circle::new(cell.x, cell.y, cell.r);
                self.tree.relocate(id, circle);
            }
        }
    }

    fn retire_cell(&mut self, id: CellId) {
        let cell = *self.arena.cell_mut(id);
        self.tree.remove(id);
        self.group_remove(id, cell.cell_type);
        self.removed.push(id);
        if cell.is_player() && self.groups[cell.cell_type as usize].is_empty() {
            if cell.eaten_by != 0 {
                let eater_type = self.arena.cell_mut(cell.eaten_by).cell_type;
                if is_player_type(eater_type) {
                    if let Some(control) = self.players.get_mut(&eater_type) {
                        control.kills += 1;
                    }
                }
            }
            if let Some(control) = self.players.get_mut(&cell.cell_type) {
                control.score = 0.0;
            }
        }
    }

    /// A fed virus resets to base size and launches a child virus in
    /// the direction it was last fed from.
    fn split_virus(&mut self, id: CellId, stats: &mut TickStats) {
        let virus_size = self.config.virus.size;
        let split_boost = self.config.virus.split_boost;
        let (x, y, angle) = {
            let cell = self.arena.cell_mut(id);
            cell.r = virus_size;
            cell.set(flags::UPDATED);
            (cell.x, cell.y, cell.boost.dx.atan2(cell.boost.dy))
        };
        let boost = Boost {
            dx: angle.sin(),
            dy: angle.cos(),
            d: split_boost,
        };
        self.try_new_cell(VIRUS_TYPE, x, y, virus_size, boost, stats);
    }

    /// A player cell that ate a virus shatters into pieces.
    fn pop_player(&mut self, id: CellId, stats: &mut TickStats) {
        let cell = *self.arena.cell_mut(id);
        let owner = cell.cell_type;
        let pieces = self.distribute_pop_mass(owner, cell.mass() * 0.01);
        if pieces.is_empty() {
            return;
        }
        if let Some(control) = self.players.get_mut(&owner) {
            control.lock_dir = false;
            control.popped_at = self.clock;
        }
        let split_boost = self.config.player.split_boost;
        let mut rng = rand::rng();
        for mass in pieces {
            let angle = rng.random_range(0.0..TAU);
            let dir = Vec2::new(angle.sin(), angle.cos());
            self.split_from_cell(id, (mass * 100.0).sqrt(), dir, split_boost, stats);
        }
    }

    /// Mass distribution for a pop: halve until each piece clears the
    /// minimum split size, then spread what remains evenly.
    fn distribute_pop_mass(&self, owner: PlayerId, mass: f32) -> Vec<f32> {
        let mut cells_left =
            self.config.player.max_cells.saturating_sub(self.groups[owner as usize].len());
        if cells_left == 0 {
            return Vec::new();
        }
        let min_split = self.config.player.min_split_size;
        let split_min = min_split * min_split / 100.0;

        if mass / (cells_left as f32) < split_min {
            let mut amount = 2usize;
            while mass / (amount as f32 + 1.0) >= split_min && amount * 2 <= cells_left {
                amount *= 2;
            }
            let per_piece = mass / (amount as f32 + 1.0);
            return vec![per_piece; amount];
        }

        let mut splits = Vec::new();
        let mut next_mass = mass / 2.0;
        let mut mass_left = mass / 2.0;
        while cells_left > 0 {
            if next_mass / (cells_left as f32) < split_min {
                break;
            }
            while next_mass >= mass_left && cells_left > 1 {
                next_mass /= 2.0;
            }
            splits.push(next_mass);
            mass_left -= next_mass;
            cells_left -= 1;
        }
        if cells_left > 0 {
            splits.extend(std::iter::repeat_n(mass_left / cells_left as f32, cells_left));
        }
        splits
    }

    /// An oversize cell splits into even pieces no larger than the
    /// autosplit threshold.
    fn autosplit(&mut self, id: CellId, stats: &mut TickStats) {
        let auto_size = self.config.player.autosplit_size;
        let split_boost = self.config.player.split_boost;
        let r = self.arena.cell_mut(id).r;
        let split_times = (r * r / (auto_size * auto_size)).ceil().max(1.0);
        let piece = (r * r / split_times).sqrt().min(auto_size);
        let mut rng = rand::rng();
        for _ in 1..split_times as usize {
            let angle = rng.random_range(0.0..TAU);
            let dir = Vec2::new(angle.sin(), angle.cos());
            self.split_from_cell(id, piece, dir, split_boost, stats);
        }
        let cell = self.arena.cell_mut(id);
        cell.r = piece;
        cell.set(flags::UPDATED);
    }

    fn project_onto_line(&mut self, id: CellId, owner: u8) {
        let Some(control) = self.players.get(&owner) else {
            return;
        };
        let (a, b, c) = (control.line_a, control.line_b, control.line_c);
        let inv = a * a + b * b;
        if inv <= 0.0 {
            return;
        }
        let inv = 1.0 / inv;
        let cell = self.arena.cell_mut(id);
        let (x0, y0) = (cell.x, cell.y);
        cell.x = (b * (b * x0 - a * y0) - a * c) * inv;
        cell.y = (a * (-b * x0 + a * y0) - b * c) * inv;
    }

    /// Carves a piece off a cell: the parent keeps the complement of
    /// the piece's mass, the piece spawns offset along `dir` with a
    /// decaying boost.
    fn split_from_cell(
        &mut self,
        parent: CellId,
        size: f32,
        dir: Vec2,
        boost: f32,
        stats: &mut TickStats,
    ) -> Option<CellId> {
        let split_dist = self.config.player.split_dist;
        let (x, y, cell_type) = {
            let cell = self.arena.cell_mut(parent);
            cell.r = (cell.r * cell.r - size * size).max(0.0).sqrt();
            cell.set(flags::UPDATED);
            (cell.x, cell.y, cell.cell_type)
        };
        self.try_new_cell(
            cell_type,
            x + split_dist * dir.x,
            y + split_dist * dir.y,
            size,
            Boost {
                dx: dir.x,
                dy: dir.y,
                d: boost,
            },
            stats,
        )
    }

    /// Places a cell directly, bypassing the spawn budget. Meant for
    /// game-mode setup (mother cells, scripted viruses, fixtures).
    /// Returns `None` when the arena is full.
    pub fn spawn_cell(&mut self, cell_type: u8, x: f32, y: f32, r: f32) -> Option<CellId> {
        let mut stats = TickStats::default();
        self.try_new_cell(cell_type, x, y, r, Boost::default(), &mut stats)
    }

    fn try_new_cell(
        &mut self,
        cell_type: u8,
        x: f32,
        y: f32,
        r: f32,
        boost: Boost,
        stats: &mut TickStats,
    ) -> Option<CellId> {
        match self.arena.allocate(cell_type, x, y, r, boost) {
            Ok(id) => {
                self.tree.insert(id, Circle::new(x, y, r));
                self.group_add(id, cell_type);
                stats.spawned += 1;
                Some(id)
            }
            Err(ArenaError::Exhausted) => {
                if !stats.arena_exhausted {
                    warn!("cell arena exhausted, skipping spawns this tick");
                }
                stats.arena_exhausted = true;
                None
            }
        }
    }

    fn group_add(&mut self, id: CellId, cell_type: u8) {
        let group = &mut self.groups[cell_type as usize];
        self.group_pos[id as usize] = group.len() as u32;
        group.push(id);
    }

    fn group_remove(&mut self, id: CellId, cell_type: u8) {
        let group = &mut self.groups[cell_type as usize];
        let pos = self.group_pos[id as usize] as usize;
        group.swap_remove(pos);
        if let Some(&moved) = group.get(pos) {
            self.group_pos[moved as usize] = pos as u32;
        }
    }

    fn random_point(&self, size: f32) -> (f32, f32) {
        let hw = self.config.world.half_width;
        let hh = self.config.world.half_height;
        let mut rng = rand::rng();
        let x = if hw > size {
            rng.random_range(-hw + size..hw - size)
        } else {
            0.0
        };
        let y = if hh > size {
            rng.random_range(-hh + size..hh - size)
        } else {
            0.0
        };
        (x, y)
    }

    /// A random point with no pellet-sized-or-bigger neighbor inside
    /// the clearance circle. Pellets and ejected mass are ignored.
    fn safe_point(&self, clearance: f32) -> Option<(f32, f32)> {
        for _ in 0..self.config.engine.safe_spawn_tries {
            let (x, y) = self.random_point(clearance);
            let probe = Shape::Circle(Circle::new(x, y, clearance));
            let blocked = self
                .tree
                .any_match(&probe, |id| self.arena.cell_type(id) <= VIRUS_TYPE);
            if !blocked {
                return Some((x, y));
            }
        }
        None
    }
}

#[derive(Clone, Copy)]
enum PairAction {
    None,
    Eat,
    Collide,
}

struct ResolveCtx<'a> {
    arena: &'a Arena,
    tree: &'a QuadTree,
    config: &'a Config,
    virus_max_size: f32,
    virus_push_boost: f32,
    collisions: &'a AtomicU32,
}

/// Narrow-phase resolution for one shard of the active list. Each
/// pair is evaluated exactly once: the larger cell runs the test,
/// ties broken toward the smaller slot id.
fn resolve_shard(ctx: &ResolveCtx, shard: &[CellId]) {
    let no_colli = ctx.config.player.no_colli_delay;
    let eat_overlap = ctx.config.eat.overlap;
    let eat_mult = ctx.config.eat.mult;
    let dead_delay = ctx.config.player.dead_delay;

    'cells: for &id in shard {
        let (snapshot_flags, snapshot_type, snapshot_age, circle) = {
            let cell = ctx.arena.lock(id);
            (
                cell.flags,
                cell.cell_type,
                cell.age,
                Circle::new(cell.x, cell.y, cell.r),
            )
        };
        if snapshot_flags & flags::SKIP_RESOLVE != 0 {
            continue;
        }
        if snapshot_type == EJECTED_TYPE && snapshot_flags & flags::UPDATED == 0 {
            continue;
        }
        if snapshot_type == DEAD_TYPE && snapshot_age > dead_delay {
            let mut cell = ctx.arena.lock(id);
            cell.set(flags::REMOVED);
            cell.eaten_by = 0;
            continue;
        }

        let mut candidates = Vec::new();
        ctx.tree.query(&Shape::Circle(circle), |other| {
            if other != id {
                candidates.push(other);
            }
        });

        for other in candidates {
            let (mut me, mut them) = ctx.arena.lock_pair(id, other);
            if me.flags & flags::SKIP_RESOLVE != 0 {
                continue 'cells;
            }
            if them.flags & flags::SKIP_RESOLVE != 0 {
                continue;
            }
            let (r1, r2) = (me.r, them.r);
            if r1 < r2 || (r1 == r2 && id > other) {
                continue;
            }

            let (t1, t2) = (me.cell_type, them.cell_type);
            let action = if is_player_type(t1) {
                if t1 == t2 {
                    if me.has(flags::MERGE) && them.has(flags::MERGE) {
                        PairAction::Eat
                    } else if me.age > no_colli && them.age > no_colli {
                        PairAction::Collide
                    } else {
                        PairAction::None
                    }
                } else {
                    PairAction::Eat
                }
            } else if t1 == VIRUS_TYPE && t2 == EJECTED_TYPE {
                PairAction::Eat
            } else if t1 == EJECTED_TYPE && t2 == EJECTED_TYPE {
                PairAction::Collide
            } else if t1 == DEAD_TYPE && t2 == DEAD_TYPE {
                PairAction::Collide
            } else {
                PairAction::None
            };
            if matches!(action, PairAction::None) {
                continue;
            }

            let dx = them.x - me.x;
            let dy = them.y - me.y;
            let r_sum = r1 + r2;
            let d_sqr = dx * dx + dy * dy;
            if d_sqr >= r_sum * r_sum {
                continue;
            }
            let d = d_sqr.sqrt();
            ctx.collisions.fetch_add(1, Relaxed);

            match action {
                PairAction::Collide => {
                    if d <= 0.0 {
                        continue;
                    }
                    let (nx, ny) = (dx / d, dy / d);
                    if d + r2 < r1 {
                        them.set(flags::INSIDE);
                    }
                    let a2 = r1 * r1;
                    let b2 = r2 * r2;
                    let sum = a2 + b2;
                    let m = r_sum - d;
                    // The heavier cell moves less.
                    let m1 = m.min(r1) * (b2 / sum);
                    me.x -= nx * m1;
                    me.y -= ny * m1;
                    let m2 = m.min(r2) * (a2 / sum);
                    them.x += nx * m2;
                    them.y += ny * m2;
                    me.set(flags::UPDATED);
                    them.set(flags::UPDATED);
                }
                PairAction::Eat => {
                    // Strict guards: barely-larger or barely-touching
                    // pairs do not eat.
                    let allowed = (t1 == t2 || r1 > r2 * eat_mult)
                        && d < r1 - r2 / eat_overlap;
                    if !allowed {
                        continue;
                    }
                    me.r = (r1 * r1 + r2 * r2).sqrt();
                    them.eaten_by = if t2 == VIRUS_TYPE || t2 == MOTHER_TYPE {
                        0
                    } else {
                        id
                    };
                    me.set(flags::UPDATED);
                    them.set(flags::REMOVED);
                    if !is_player_type(t1) {
                        // Radius-change marker for non-player eaters.
                        me.set(flags::AUTOSPLIT);
                    }

                    if is_player_type(t1) && t2 == EJECTED_TYPE {
                        let ratio = them.r / (me.r + 100.0);
                        me.boost.d += ratio * 0.025 * them.boost.d;
                        let v = Vec2::new(
                            me.boost.dx + ratio * 0.02 * them.boost.dx,
                            me.boost.dy + ratio * 0.02 * them.boost.dy,
                        )
                        .normalize_or_zero();
                        me.boost.dx = v.x;
                        me.boost.dy = v.y;
                    }
                    if t2 == VIRUS_TYPE || t2 == MOTHER_TYPE {
                        me.set(flags::POP);
                    }
                    if t1 == VIRUS_TYPE && t2 == EJECTED_TYPE {
                        if ctx.virus_max_size > 0.0 && me.r >= ctx.virus_max_size {
                            me.set(flags::POP);
                            me.boost.dx = them.boost.dx;
                            me.boost.dy = them.boost.dy;
                        }
                        if ctx.virus_push_boost > 0.0 {
                            let push = ctx.virus_push_boost;
                            let new_boost =
                                (me.boost.d + push).min(ctx.config.virus.max_boost);
                            let v = Vec2::new(
                                me.boost.dx * me.boost.d + them.boost.dx * push,
                                me.boost.dy * me.boost.d + them.boost.dy * push,
                            )
                            .normalize_or_zero();
                            me.boost.dx = v.x;
                            me.boost.dy = v.y;
                            me.boost.d = new_boost;
                        }
                    }
                }
                PairAction::None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.engine.threads = 2;
        config.pellet.count = 0;
        config.virus.count = 0;
        config
    }

    fn raw_cell(engine: &mut Engine, cell_type: u8, x: f32, y: f32, r: f32) -> CellId {
        engine.spawn_cell(cell_type, x, y, r).unwrap()
    }

    #[test]
    fn merge_eligible_pair_fuses_in_one_tick() {
        let mut engine = Engine::new(quiet_config());
        let a = raw_cell(&mut engine, 1, 0.0, 0.0, 50.0);
        let b = raw_cell(&mut engine, 1, 10.0, 0.0, 50.0);
        for id in [a, b] {
            let cell = engine.arena.cell_mut(id);
            cell.age = 1.0e6;
            cell.set(flags::MERGE);
        }

        engine.tick(50.0);

        // Equal radii: the smaller slot id wins the tie-break.
        let winner = engine.arena.cell_mut(a);
        assert!((winner.r - 70.710_68).abs() < 0.01);
        let loser = engine.arena.cell_mut(b);
        assert!(loser.has(flags::REMOVED));
        assert_eq!(loser.eaten_by, a);
    }

    #[test]
    fn mass_is_conserved_on_merge() {
        let mut engine = Engine::new(quiet_config());
        let a = raw_cell(&mut engine, 1, 0.0, 0.0, 40.0);
        let b = raw_cell(&mut engine, 1, 5.0, 0.0, 30.0);
        for id in [a, b] {
            let cell = engine.arena.cell_mut(id);
            cell.age = 1.0e6;
            cell.set(flags::MERGE);
        }
        engine.tick(50.0);
        assert!((engine.arena.cell_mut(a).r - 50.0).abs() < 0.01);
    }

    #[test]
    fn eat_distance_guard_is_strict() {
        let mut config = quiet_config();
        config.eat.mult = 1.1;

        // At exactly r1 - r2/overlap the eat must not happen.
        let mut engine = Engine::new(config.clone());
        let a = raw_cell(&mut engine, 1, 0.0, 0.0, 100.0);
        let b = raw_cell(&mut engine, 2, 70.0, 0.0, 90.0);
        engine.tick(50.0);
        assert!(!engine.arena.cell_mut(b).has(flags::REMOVED));
        assert_eq!(engine.arena.cell_mut(a).r, 100.0);

        // One unit closer it does.
        let mut engine = Engine::new(config);
        let a = raw_cell(&mut engine, 1, 0.0, 0.0, 100.0);
        let b = raw_cell(&mut engine, 2, 69.0, 0.0, 90.0);
        engine.tick(50.0);
        assert!(engine.arena.cell_mut(b).has(flags::REMOVED));
        let expected = (100.0f32 * 100.0 + 90.0 * 90.0).sqrt();
        assert!((engine.arena.cell_mut(a).r - expected).abs() < 0.01);
    }

    #[test]
    fn pellet_eat_is_attributed_and_slot_recycled() {
        let mut engine = Engine::new(quiet_config());
        let player = raw_cell(&mut engine, 3, 0.0, 0.0, 100.0);
        let pellet = raw_cell(&mut engine, PELLET_TYPE, 5.0, 0.0, 10.0);

        engine.tick(50.0);
        assert_eq!(engine.arena.eaten_by(pellet), player);
        assert!((engine.arena.r(player) - 10100.0f32.sqrt()).abs() < 0.01);

        // The slot is zeroed by the next tick's cleanup.
        engine.tick(50.0);
        assert_eq!(engine.arena.len(), 1);
    }

    #[test]
    fn boundary_bounce_flips_boost_component() {
        let mut engine = Engine::new(quiet_config());
        let hw = engine.config.world.half_width;
        let id = raw_cell(&mut engine, EJECTED_TYPE, -hw + 40.0, 0.0, 38.0);
        {
            let cell = engine.arena.cell_mut(id);
            cell.boost = Boost {
                dx: -1.0,
                dy: 0.0,
                d: 500.0,
            };
        }
        engine.tick(50.0);
        let cell = engine.arena.cell_mut(id);
        assert_eq!(cell.x, -hw + 38.0);
        assert!(cell.boost.dx > 0.0);
    }

    #[test]
    fn dead_cells_expire_unattributed() {
        let mut config = quiet_config();
        config.player.dead_delay = 100.0;
        let mut engine = Engine::new(config);
        engine.add_player(4);
        let cell = raw_cell(&mut engine, 4, 0.0, 0.0, 60.0);
        let _ = cell;

        engine.kill_player(4, true);
        assert_eq!(engine.groups[DEAD_TYPE as usize].len(), 1);
        let tomb = engine.groups[DEAD_TYPE as usize][0];

        engine.tick(60.0);
        engine.tick(60.0);
        assert!(engine.groups[DEAD_TYPE as usize].is_empty());
        assert_eq!(engine.arena.eaten_by(tomb), 0);
    }

    #[test]
    fn oversize_cell_autosplits_after_the_delay() {
        let mut engine = Engine::new(quiet_config());
        let id = raw_cell(&mut engine, 5, 0.0, 0.0, 1600.0);
        let initial_mass = engine.arena.cell_mut(id).mass();

        for _ in 0..4 {
            engine.tick(50.0);
        }
        let group = &engine.groups[5usize];
        assert!(group.len() > 1, "expected an autosplit to have fired");
        let auto = engine.config.player.autosplit_size;
        let mut total = 0.0;
        for &cell_id in group {
            let r = engine.arena.r(cell_id);
            assert!(r <= auto + 1.0);
            total += r * r;
        }
        assert!((total - initial_mass).abs() / initial_mass < 0.02);
    }

    #[test]
    fn virus_pop_shatters_player_cell() {
        let mut config = quiet_config();
        config.player.no_colli_delay = 0.0;
        let mut engine = Engine::new(config);
        engine.add_player(6);
        let player = raw_cell(&mut engine, 6, 0.0, 0.0, 200.0);
        let virus = raw_cell(&mut engine, VIRUS_TYPE, 20.0, 0.0, 100.0);
        let _ = player;

        engine.tick(50.0);
        // Virus consumed without attribution; the player shattered
        // into multiple pieces of conserved total mass.
        assert!(engine.arena.cell_mut(virus).has(flags::REMOVED));
        assert_eq!(engine.arena.eaten_by(virus), 0);
        let group = &engine.groups[6usize];
        assert!(group.len() > 1);
        let total: f32 = group.iter().map(|&c| engine.arena.r(c).powi(2)).sum();
        let expected = 200.0f32 * 200.0 + 100.0 * 100.0;
        assert!((total - expected).abs() / expected < 0.02);
    }

    #[test]
    fn spawning_tops_up_pellets_within_budget() {
        let mut config = Config::default();
        config.engine.threads = 1;
        config.virus.count = 0;
        config.pellet.count = 120;
        let mut engine = Engine::new(config);

        let stats = engine.tick(50.0);
        assert_eq!(stats.spawned, 50);
        let stats = engine.tick(50.0);
        assert_eq!(stats.spawned, 50);
        let stats = engine.tick(50.0);
        assert_eq!(stats.spawned, 20);
        assert_eq!(engine.groups[PELLET_TYPE as usize].len(), 120);
    }
}
