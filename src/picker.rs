//! Rarest-first piece selection.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::peer::PeerLink;
use crate::piece::Piece;

struct PickerState {
    current: Option<Arc<Piece>>,
    verified: HashSet<u32>,
}

/// Rarest-first piece selection with a sticky current piece.
///
/// All requesting peers keep hammering the same in-progress piece, which
/// finishes pieces quickly on thin swarms; rarest-first kicks in when the
/// current piece is verified or saturated. Rarity protects uniquely-held
/// pieces from disappearing with their sole holder.
///
/// One picker exists per torrent session; [`find`](Self::find) is a single
/// atomic operation under the picker's mutex, since dispatcher workers and
/// the scheduler call it concurrently.
pub struct RarestFirstPicker {
    state: Mutex<PickerState>,
}

impl RarestFirstPicker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PickerState {
                current: None,
                verified: HashSet::new(),
            }),
        }
    }

    /// Picks the piece requests should be drawn from.
    ///
    /// The cached current piece is returned as long as it is unverified and
    /// still has a missing block. Otherwise every connected peer's bitfield
    /// is folded into a rarity histogram and the unverified, unsaturated
    /// piece with the smallest positive count wins, ties broken by lowest
    /// index. Pieces nobody holds (count zero) are never selected. Returns
    /// `None` when no piece anywhere can accept a request.
    pub fn find(&self, links: &[Arc<PeerLink>], pieces: &[Arc<Piece>]) -> Option<Arc<Piece>> {
        let mut state = self.state.lock();

        if let Some(current) = state.current.clone() {
            if current.is_verified() {
                state.verified.insert(current.index());
                state.current = None;
            } else if !current.all_blocks_requested() {
                return Some(current);
            } else {
                // Saturated: awaiting completions, cannot accept requests.
                state.current = None;
            }
        }

        let mut counts = vec![0u32; pieces.len()];
        for link in links {
            let bitfield = link.bitfield();
            for (index, count) in counts.iter_mut().enumerate() {
                if bitfield.has_piece(index) {
                    *count += 1;
                }
            }
        }

        let mut rarest: Option<(u32, usize)> = None;
        for (index, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let piece = &pieces[index];
            if state.verified.contains(&piece.index())
                || piece.is_verified()
                || piece.all_blocks_requested()
            {
                continue;
            }
            if rarest.map_or(true, |(best, _)| count < best) {
                rarest = Some((count, index));
            }
        }

        state.current = rarest.map(|(_, index)| pieces[index].clone());
        state.current.clone()
    }

    /// Number of pieces the picker has retired as verified.
    pub fn verified_count(&self) -> usize {
        self.state.lock().verified.len()
    }
}

impl Default for RarestFirstPicker {
    fn default() -> Self {
        Self::new()
    }
}
