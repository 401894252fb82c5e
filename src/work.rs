// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! The work item handed down by the host's work source. Everything here is
//! read-only to the driver except `starting_nonce`, which range-mode
//! scanning claims a slice of on each retry.

/// A block-header candidate ready to be swept for a winning nonce.
///
/// `data` is the 128-byte block header; only `data[64..76]` (the tail) is
/// ever transmitted to the device.
pub struct Work {
    pub midstate: [u8; 32],
    pub data: [u8; 128],
    starting_nonce: u32,
}

impl Work {
    pub fn new(midstate: [u8; 32], data: [u8; 128]) -> Self {
        Self {
            midstate,
            data,
            starting_nonce: 0,
        }
    }

    pub fn block_tail(&self) -> [u8; 12] {
        let mut tail = [0u8; 12];
        tail.copy_from_slice(&self.data[64..76]);
        tail
    }

    pub fn starting_nonce(&self) -> u32 {
        self.starting_nonce
    }

    pub fn set_starting_nonce(&mut self, nonce: u32) {
        self.starting_nonce = nonce;
    }
}

/// Host-supplied predicate: `true` once this work item would no longer be
/// useful (a new block arrived upstream). Consulted at every cancellable
/// sleep point in the Scan Engine.
pub trait StaleCheck {
    fn is_stale(&self) -> bool;
}

impl<F: Fn() -> bool> StaleCheck for F {
    fn is_stale(&self) -> bool {
        self()
    }
}

/// A `StaleCheck` that never reports staleness, for tests and hosts that
/// don't track block height.
pub struct NeverStale;

impl StaleCheck for NeverStale {
    fn is_stale(&self) -> bool {
        false
    }
}
