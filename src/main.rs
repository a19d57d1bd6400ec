/**
 * Copyright (c) 2024-2025 MAAS Developers.
 *
 * This file is part of MAAS Agent
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use maas_agent::config::{config_path, AgentConfig, AgentPaths};
use maas_agent::control::{BootstrapControlPlane, ServiceController};
use maas_agent::resolver::client::{ClientConfig, PooledClient};
use maas_agent::resolver::handler::{RecursiveHandler, DEFAULT_SESSION_TTL};
use maas_agent::resolver::service::ResolverService;

fn main() {
    let path = config_path();
    let config = match AgentConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("could not load configuration from {}: {err}", path.display());
            std::process::exit(1);
        }
    };

    // logger setup, RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("maas-agent")
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("could not start runtime: {err}");
            std::process::exit(1);
        }
    };
    if let Err(code) = runtime.block_on(run(config)) {
        std::process::exit(code);
    }
}

async fn run(config: AgentConfig) -> Result<(), i32> {
    let paths = AgentPaths::detect();
    info!(
        run_dir = %paths.run_dir.display(),
        cache_dir = %paths.cache_dir.display(),
        "agent starting",
    );

    let handler = Arc::new(RecursiveHandler::new(
        Arc::new(PooledClient::new(ClientConfig::default())),
        DEFAULT_SESSION_TTL,
    ));
    let mut resolver = ResolverService::new(handler.clone());
    let fatal = resolver.errors();

    let control = Arc::new(BootstrapControlPlane::from_config(&config));
    let system_id = config.system_id.clone().unwrap_or_default();
    let has_controllers = !config.controllers.is_empty();
    let controller = ServiceController::new(control, config, &paths, handler, resolver);

    // bootstrap configuration; the orchestration runtime reconfigures the
    // services later through the same entry points
    if has_controllers {
        if let Err(err) = controller.configure_httpproxy_service(&system_id).await {
            error!(error = %err, "could not configure httpproxy service");
            return Err(1);
        }
    } else {
        info!("no controllers configured, httpproxy stays down");
    }
    if let Err(err) = controller.configure_resolver_service(&system_id).await {
        error!(error = %err, "could not configure resolver service");
        return Err(1);
    }

    let result = wait_for_shutdown(fatal).await;
    drop(controller);
    result
}

// block until a shutdown signal arrives or a listener dies
async fn wait_for_shutdown(
    fatal: Option<tokio::sync::mpsc::UnboundedReceiver<std::io::Error>>,
) -> Result<(), i32> {
    let mut fatal = match fatal {
        Some(fatal) => fatal,
        None => return Ok(()),
    };
    let mut interrupt = signal(SignalKind::interrupt()).map_err(|_| 1)?;
    let mut terminate = signal(SignalKind::terminate()).map_err(|_| 1)?;
    let mut quit = signal(SignalKind::quit()).map_err(|_| 1)?;
    tokio::select! {
        _ = interrupt.recv() => {
            info!("interrupt signalled, shutting down");
            Ok(())
        }
        _ = terminate.recv() => {
            info!("termination signalled, shutting down");
            Ok(())
        }
        _ = quit.recv() => {
            info!("quit signalled, shutting down");
            Ok(())
        }
        err = fatal.recv() => match err {
            Some(err) => {
                error!(error = %err, "listener failed");
                Err(1)
            }
            // every sender is gone, nothing left to watch
            None => Ok(()),
        }
    }
}
