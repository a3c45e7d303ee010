// dcm is an open source tool for distributed refinement of graph clusterings.
// Copyright (C) 2024 the dcm authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Delay schedules for dial retries and idle polling.

use std::time::Duration;

/// Doubling delay with a cap and a deterministic per-instance stagger.
///
/// `salt` shifts the schedule: worker ranks launched in the same scheduler
/// allocation would otherwise retry in lockstep and arrive at the
/// coordinator in one burst. Salt 0 gives the plain doubling schedule; the
/// stagger stays under a quarter of the base delay, so waits remain bounded
/// by `cap` plus that margin.
#[derive(Debug, Clone)]
pub struct Backoff {
    start_ms: u64,
    next_ms: u64,
    cap_ms: u64,
    salt: u64,
}

impl Backoff {
    pub fn new(start: Duration, cap: Duration) -> Self {
        Self::salted(start, cap, 0)
    }

    pub fn salted(start: Duration, cap: Duration, salt: u64) -> Self {
        let start_ms = (start.as_millis() as u64).max(1);
        Self {
            start_ms,
            next_ms: start_ms,
            cap_ms: cap.as_millis() as u64,
            salt,
        }
    }

    /// The next wait. Doubles on every call until the cap.
    pub fn delay(&mut self) -> Duration {
        let base = self.next_ms.min(self.cap_ms);
        self.next_ms = self.next_ms.saturating_mul(2);

        let stagger = base * (self.salt % 16) / 64;
        Duration::from_millis(base + stagger)
    }

    /// Back to the start of the schedule, after a successful exchange or a
    /// non-empty batch.
    pub fn reset(&mut self) {
        self.next_ms = self.start_ms;
    }
}
