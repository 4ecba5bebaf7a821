//! World-update delta frames.
//!
//! Each tick every viewer receives one delta frame classifying the
//! cells of its viewport against the previous tick: Add, Update, Eat,
//! Delete. The frame is a fixed header followed by four sections, each
//! terminated by a zero cell id (id 0 is reserved and never assigned).
//!
//! Layout (little-endian):
//! - header: `opcode:u8, own_cells:u8, line_lock:u8, view_x:f32, view_y:f32`
//! - `Add[]`:    `id:u16, type:u16, x:i16, y:i16, r:u16`, 0-terminated
//! - `Update[]`: `id:u16, x:i16, y:i16, r:u16`, 0-terminated
//! - `Eat[]`:    `id:u16, eaten_by:u16`, 0-terminated
//! - `Delete[]`: `id:u16`, 0-terminated

use crate::binary::{Reader, Writer};
use crate::error::ProtocolError;
use bytes::Bytes;

/// Opcode of the world-update frame.
pub const OP_WORLD_UPDATE: u8 = 0x04;

/// A cell entering the viewport this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRecord {
    pub id: u16,
    /// Cell type; 0..=250 doubles as the owning player id.
    pub cell_type: u16,
    pub x: i16,
    pub y: i16,
    pub r: u16,
}

/// A cell present in both generations (never a pellet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRecord {
    pub id: u16,
    pub x: i16,
    pub y: i16,
    pub r: u16,
}

/// A cell that left the viewport because something consumed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EatRecord {
    pub id: u16,
    /// Consumer id; dangling for at most one tick via tombstones.
    pub eaten_by: u16,
}

/// One per-viewer delta frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateFrame {
    /// Number of cells the viewer owns (player frames only).
    pub own_cells: u8,
    /// Non-zero while the viewer's cells are locked to a line.
    pub line_lock: u8,
    pub view_x: f32,
    pub view_y: f32,
    pub adds: Vec<AddRecord>,
    pub updates: Vec<UpdateRecord>,
    pub eats: Vec<EatRecord>,
    pub deletes: Vec<u16>,
}

impl UpdateFrame {
    /// Serialize the frame.
    pub fn encode(&self) -> Bytes {
        let cap = 11
            + self.adds.len() * 10
            + self.updates.len() * 8
            + self.eats.len() * 4
            + self.deletes.len() * 2
            + 8;
        let mut w = Writer::with_capacity(cap);

        w.put_u8(OP_WORLD_UPDATE);
        w.put_u8(self.own_cells);
        w.put_u8(self.line_lock);
        w.put_f32(self.view_x);
        w.put_f32(self.view_y);

        for add in &self.adds {
            w.put_u16(add.id);
            w.put_u16(add.cell_type);
            w.put_i16(add.x);
            w.put_i16(add.y);
            w.put_u16(add.r);
        }
        w.put_u16(0);

        for up in &self.updates {
            w.put_u16(up.id);
            w.put_i16(up.x);
            w.put_i16(up.y);
            w.put_u16(up.r);
        }
        w.put_u16(0);

        for eat in &self.eats {
            w.put_u16(eat.id);
            w.put_u16(eat.eaten_by);
        }
        w.put_u16(0);

        for &id in &self.deletes {
            w.put_u16(id);
        }
        w.put_u16(0);

        w.finish()
    }

    /// Parse a frame produced by [`UpdateFrame::encode`].
    pub fn decode(data: impl Into<Bytes>) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);

        let opcode = r.try_get_u8().ok_or(ProtocolError::UnexpectedEof)?;
        if opcode != OP_WORLD_UPDATE {
            return Err(ProtocolError::InvalidOpcode(opcode));
        }

        let mut frame = UpdateFrame {
            own_cells: r.try_get_u8().ok_or(ProtocolError::UnexpectedEof)?,
            line_lock: r.try_get_u8().ok_or(ProtocolError::UnexpectedEof)?,
            view_x: r.try_get_f32().ok_or(ProtocolError::UnexpectedEof)?,
            view_y: r.try_get_f32().ok_or(ProtocolError::UnexpectedEof)?,
            ..Default::default()
        };

        loop {
            let id = r.try_get_u16().ok_or(ProtocolError::UnexpectedEof)?;
            if id == 0 {
                break;
            }
            frame.adds.push(AddRecord {
                id,
                cell_type: r.try_get_u16().ok_or(ProtocolError::UnexpectedEof)?,
                x: r.try_get_i16().ok_or(ProtocolError::UnexpectedEof)?,
                y: r.try_get_i16().ok_or(ProtocolError::UnexpectedEof)?,
                r: r.try_get_u16().ok_or(ProtocolError::UnexpectedEof)?,
            });
        }

        loop {
            let id = r.try_get_u16().ok_or(ProtocolError::UnexpectedEof)?;
            if id == 0 {
                break;
            }
            frame.updates.push(UpdateRecord {
                id,
                x: r.try_get_i16().ok_or(ProtocolError::UnexpectedEof)?,
                y: r.try_get_i16().ok_or(ProtocolError::UnexpectedEof)?,
                r: r.try_get_u16().ok_or(ProtocolError::UnexpectedEof)?,
            });
        }

        loop {
            let id = r.try_get_u16().ok_or(ProtocolError::UnexpectedEof)?;
            if id == 0 {
                break;
            }
            frame.eats.push(EatRecord {
                id,
                eaten_by: r.try_get_u16().ok_or(ProtocolError::UnexpectedEof)?,
            });
        }

        loop {
            let id = r.try_get_u16().ok_or(ProtocolError::UnexpectedEof)?;
            if id == 0 {
                break;
            }
            frame.deletes.push(id);
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_frame_roundtrip() {
        let frame = UpdateFrame {
            view_x: 12.0,
            view_y: -8.0,
            ..Default::default()
        };
        let bytes = frame.encode();
        // Header (11) + four terminators (8).
        assert_eq!(bytes.len(), 19);
        assert_eq!(UpdateFrame::decode(bytes).unwrap(), frame);
    }

    #[test]
    fn full_frame_roundtrip() {
        let frame = UpdateFrame {
            own_cells: 2,
            line_lock: 1,
            view_x: 100.5,
            view_y: 200.25,
            adds: vec![AddRecord { id: 7, cell_type: 254, x: -5, y: 12, r: 10 }],
            updates: vec![UpdateRecord { id: 9, x: 40, y: -40, r: 71 }],
            eats: vec![EatRecord { id: 3, eaten_by: 9 }, EatRecord { id: 4, eaten_by: 0 }],
            deletes: vec![11, 12],
        };
        assert_eq!(UpdateFrame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn rejects_wrong_opcode() {
        let mut w = Writer::new();
        w.put_u8(0x63);
        assert!(matches!(
            UpdateFrame::decode(w.finish()),
            Err(ProtocolError::InvalidOpcode(0x63))
        ));
    }

    #[test]
    fn rejects_truncated_frame() {
        let frame = UpdateFrame::default();
        let bytes = frame.encode();
        let cut = bytes.slice(..bytes.len() - 3);
        assert!(matches!(
            UpdateFrame::decode(cut),
            Err(ProtocolError::UnexpectedEof)
        ));
    }
}
