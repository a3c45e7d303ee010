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

pub struct Coordinator;

impl Coordinator {
    pub fn work_dir() -> String {
        "dcm-work-dir".to_string()
    }

    pub fn num_workers() -> u32 {
        1
    }

    pub fn min_batch_cost() -> f64 {
        1.0
    }

    pub fn cost_alpha() -> f64 {
        1.0
    }

    pub fn max_retries() -> u32 {
        2
    }

    pub fn stall_warn_secs() -> u64 {
        600
    }
}

pub struct Worker;

impl Worker {
    pub fn work_dir() -> String {
        "dcm-work-dir".to_string()
    }

    /// Seconds; non-positive means no limit.
    pub fn time_limit_per_cluster() -> i64 {
        -1
    }

    /// Send a report every N work requests; non-positive disables reports.
    pub fn report_interval() -> i64 {
        10
    }
}

pub struct Refiner;

impl Refiner {
    pub fn clustering_parameter() -> f64 {
        0.01
    }

    pub fn connectedness_criterion() -> String {
        "1log_10(n)".to_string()
    }
}
