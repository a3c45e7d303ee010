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
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dcm::entrypoint;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Args {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy the coordinator. It partitions the input (or resumes from a
    /// checkpoint), serves the job-distribution protocol and writes the
    /// final clustering.
    Coordinator { config_path: String },

    /// Deploy one worker rank against a remote coordinator.
    Worker { config_path: String },

    /// Run coordinator and worker in a single process. Useful on one
    /// machine; the protocol is identical to the distributed deployment.
    Local { config_path: String },

    /// Partition the input into per-cluster files and stop without
    /// launching any computation jobs.
    Partition { config_path: String },
}

fn load_toml_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> T {
    let path = path.as_ref();
    let raw_config = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: '{}'", path.display()))
        .unwrap();
    toml::from_str(&raw_config)
        .with_context(|| format!("Failed to parse config: '{}'", path.display()))
        .unwrap()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive("dcm=info".parse().unwrap())
                .from_env_lossy(),
        )
        .without_time()
        .with_target(false)
        .finish()
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Coordinator { config_path } => {
            let config = load_toml_config(config_path);

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(entrypoint::coordinator::run(config))?;
        }
        Commands::Worker { config_path } => {
            let config = load_toml_config(config_path);

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(entrypoint::worker::run(config))?;
        }
        Commands::Local { config_path } => {
            let config = load_toml_config(config_path);

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(entrypoint::local::run(config))?;
        }
        Commands::Partition { config_path } => {
            let config = load_toml_config(config_path);
            entrypoint::partition::run(config)?;
        }
    }

    Ok(())
}
