//! Per-viewer visibility diffing.
//!
//! A [`Viewer`] keeps two generations of visible-cell state: a dense
//! presence table indexed by cell id plus a compact id list. Each
//! frame the generations swap, the viewport is re-queried, and every
//! id is classified as Add, Update, Eat, or Delete relative to the
//! previous generation. Frames must be built between ticks, while
//! retired slots still carry their `eaten_by` attribution.

use bytes::Bytes;
use protocol::{AddRecord, EatRecord, UpdateFrame, UpdateRecord};

use crate::arena::{CellId, CELL_CAPACITY, PELLET_TYPE};
use crate::engine::{Engine, PlayerId};
use crate::spatial::Rect;

pub struct Viewer {
    player: Option<PlayerId>,
    current: Box<[u8]>,
    last: Box<[u8]>,
    current_ids: Vec<CellId>,
    last_ids: Vec<CellId>,
    view: Rect,
}

impl Viewer {
    /// A viewer following a player's cells.
    pub fn new(player: PlayerId) -> Self {
        Self::with_view(Some(player), Rect::default())
    }

    /// A free camera over a fixed rectangle.
    pub fn spectator(view: Rect) -> Self {
        Self::with_view(None, view)
    }

    fn with_view(player: Option<PlayerId>, view: Rect) -> Self {
        Self {
            player,
            current: vec![0u8; CELL_CAPACITY].into_boxed_slice(),
            last: vec![0u8; CELL_CAPACITY].into_boxed_slice(),
            current_ids: Vec::new(),
            last_ids: Vec::new(),
            view,
        }
    }

    #[inline]
    pub fn view(&self) -> Rect {
        self.view
    }

    /// Moves a spectator camera. Ignored for player-bound viewers,
    /// whose viewport follows their cells.
    pub fn set_view(&mut self, view: Rect) {
        if self.player.is_none() {
            self.view = view;
        }
    }

    /// Builds one delta frame against the previous generation.
    pub fn build_frame(&mut self, engine: &Engine) -> Bytes {
        // Swap generations; the table inherited from two frames ago
        // is cleared through its id list, never wholesale.
        std::mem::swap(&mut self.current, &mut self.last);
        std::mem::swap(&mut self.current_ids, &mut self.last_ids);
        for &id in &self.current_ids {
            self.current[id as usize] = 0;
        }
        self.current_ids.clear();

        if let Some(player) = self.player {
            if engine.is_alive(player) {
                self.view = engine.player_viewport(player);
            }
        }

        let current = &mut self.current;
        let current_ids = &mut self.current_ids;
        engine.query_viewport(self.view, |id| {
            if current[id as usize] == 0 {
                current[id as usize] = 1;
                current_ids.push(id);
            }
        });

        let arena = engine.arena();
        let mut frame = UpdateFrame {
            own_cells: self
                .player
                .map_or(0, |p| engine.own_cell_count(p).min(255) as u8),
            line_lock: self
                .player
                .and_then(|p| engine.control(p))
                .map_or(0, |c| c.lock_dir as u8),
            view_x: self.view.x,
            view_y: self.view.y,
            adds: Vec::new(),
            updates: Vec::new(),
            eats: Vec::new(),
            deletes: Vec::new(),
        };

        for &id in &self.current_ids {
            let (x, y, r) = (
                arena.x(id).round() as i16,
                arena.y(id).round() as i16,
                arena.r(id).round() as u16,
            );
            if self.last[id as usize] != 0 {
                // Pellets are immutable once placed; everything else
                // re-reports every frame.
                if arena.cell_type(id) != PELLET_TYPE {
                    frame.updates.push(UpdateRecord { id, x, y, r });
                }
            } else {
                frame.adds.push(AddRecord {
                    id,
                    cell_type: arena.cell_type(id) as u16,
                    x,
                    y,
                    r,
                });
            }
        }

        for &id in &self.last_ids {
            if self.current[id as usize] != 0 {
                continue;
            }
            let eaten_by = arena.eaten_by(id);
            if eaten_by != 0 {
                frame.eats.push(EatRecord { id, eaten_by });
            } else {
                frame.deletes.push(id);
            }
        }

        frame.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::{EJECTED_TYPE, VIRUS_TYPE};
    use crate::config::Config;
    use crate::engine::Engine;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.engine.threads = 1;
        config.pellet.count = 0;
        config.virus.count = 0;
        config
    }

    fn whole_map(engine: &Engine) -> Rect {
        Rect::new(
            0.0,
            0.0,
            engine.config().world.half_width,
            engine.config().world.half_height,
        )
    }

    fn decode(bytes: Bytes) -> UpdateFrame {
        UpdateFrame::decode(bytes).expect("frame should decode")
    }

    #[test]
    fn lifecycle_classification() {
        let mut engine = Engine::new(quiet_config());
        let mut viewer = Viewer::spectator(whole_map(&engine));

        let a = engine.spawn_cell(1, 0.0, 0.0, 50.0).unwrap();
        let b = engine.spawn_cell(1, 10.0, 0.0, 50.0).unwrap();
        engine.tick(50.0);

        let frame = decode(viewer.build_frame(&engine));
        let mut added: Vec<_> = frame.adds.iter().map(|r| r.id).collect();
        added.sort_unstable();
        assert_eq!(added, vec![a, b]);
        assert!(frame.updates.is_empty() && frame.eats.is_empty());

        // Second generation: both cells seen before, both player
        // cells, so both report as updates.
        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert_eq!(frame.updates.len(), 2);
        assert!(frame.adds.is_empty());
    }

    #[test]
    fn eaten_cells_are_attributed() {
        let mut engine = Engine::new(quiet_config());
        let mut viewer = Viewer::spectator(whole_map(&engine));

        // Age the pellet first so it is visible before anything can
        // touch it, then drop a big cell on top of it.
        let prey = engine.spawn_cell(PELLET_TYPE, 5.0, 0.0, 10.0).unwrap();
        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert_eq!(frame.adds.len(), 1);

        let player = engine.spawn_cell(2, 0.0, 0.0, 100.0).unwrap();
        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert!(frame
            .eats
            .iter()
            .any(|e| e.id == prey && e.eaten_by == player));
        assert!(frame.deletes.is_empty());
    }

    #[test]
    fn pellets_never_update() {
        let mut config = quiet_config();
        config.pellet.count = 5;
        let mut engine = Engine::new(config);
        let mut viewer = Viewer::spectator(whole_map(&engine));

        // Tick once to place pellets, once more so they pass the
        // young-pellet visibility filter.
        engine.tick(50.0);
        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert_eq!(frame.adds.len(), 5);

        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert!(frame.adds.is_empty());
        assert!(frame.updates.is_empty());
        assert!(frame.eats.is_empty() && frame.deletes.is_empty());
    }

    #[test]
    fn idle_non_pellets_still_update() {
        let mut engine = Engine::new(quiet_config());
        let mut viewer = Viewer::spectator(whole_map(&engine));
        let virus = engine.spawn_cell(VIRUS_TYPE, 0.0, 0.0, 100.0).unwrap();

        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert_eq!(frame.adds.len(), 1);

        // Present in both generations: an Update every frame, even
        // though nothing touched it.
        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert!(frame.adds.is_empty());
        assert_eq!(frame.updates.len(), 1);
        assert_eq!(frame.updates[0].id, virus);
    }

    #[test]
    fn deletes_are_unattributed_removals() {
        let mut config = quiet_config();
        config.eject.max_age = 60.0;
        let mut engine = Engine::new(config);
        let mut viewer = Viewer::spectator(whole_map(&engine));

        let stray = engine
            .spawn_cell(EJECTED_TYPE, 100.0, 100.0, 38.0)
            .unwrap();
        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert_eq!(frame.adds.len(), 1);

        // Ages past max_age, removed without an eater.
        engine.tick(50.0);
        let frame = decode(viewer.build_frame(&engine));
        assert_eq!(frame.deletes, vec![stray]);
        assert!(frame.eats.is_empty());
    }

    #[test]
    fn own_cell_count_and_header_follow_the_player() {
        let mut engine = Engine::new(quiet_config());
        engine.add_player(9);
        engine.request_spawn(9);
        engine.tick(50.0);
        assert!(engine.is_alive(9));

        let mut viewer = Viewer::new(9);
        let frame = decode(viewer.build_frame(&engine));
        assert_eq!(frame.own_cells, 1);
        assert_eq!(frame.line_lock, 0);
        assert_eq!(frame.adds.len(), 1);
    }
}
