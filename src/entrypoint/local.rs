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

//! World size 1: coordinator and worker cohabit one process as two tasks.
//!
//! The worker speaks the same loopback transport the N-rank deployment
//! uses. There is deliberately no in-process fast path, so every protocol
//! property observed here holds unchanged in the distributed case.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;

use crate::{
    config::LocalConfig,
    distributed::channel::Listener,
    worker::Worker,
};

use super::coordinator::{drain, init, install_signal_handlers, spawn_accept_loop};

pub async fn run(config: LocalConfig) -> Result<()> {
    let mut coordinator_config = config.coordinator;
    coordinator_config.num_workers = 1;

    super::prepare_work_dir(&coordinator_config)?;

    let checkpoint_path = coordinator_config.work_dir().join("checkpoint");
    let coordinator = Arc::new(init(&coordinator_config)?);

    install_signal_handlers(checkpoint_path.clone(), Arc::clone(&coordinator))?;

    let listener = Listener::bind(coordinator_config.host).await?;
    let addr = listener.local_addr()?;
    tracing::info!(host = %addr, "coordinator listening");
    let accept = spawn_accept_loop(listener, Arc::clone(&coordinator));

    // the single worker takes rank 0, sharing it with the coordinator
    let worker = Worker::new(
        0,
        addr,
        &coordinator_config.work_dir(),
        coordinator_config.clusters_dir(),
        config.worker.refiner.clone(),
        config.worker.time_limit(),
        config.worker.report_every(),
    )?;
    let mut worker_task = tokio::spawn(worker.run());

    let stall_warn = Duration::from_secs(coordinator_config.stall_warn_secs);
    tokio::select! {
        _ = drain(&coordinator, stall_warn) => {
            worker_task.await??;
        }
        // a dead worker can never drain the run; fail instead of hanging
        res = &mut worker_task => {
            res??;
            drain(&coordinator, stall_warn).await;
        }
    }
    accept.abort();

    coordinator.finalize(
        coordinator_config.work_dir().join("output"),
        PathBuf::from(&coordinator_config.output_file),
    )?;

    std::fs::remove_file(&checkpoint_path).ok();

    let stats = coordinator.stats();
    tracing::info!(
        completed = stats.completed,
        bypassed = stats.bypassed,
        dropped = stats.dropped,
        "run complete"
    );

    Ok(())
}
