// SPDX-License-Identifier: MIT

//! Entry point for a spawned machine process: resolves its CLI
//! configuration, registers with the agent that spawned it, then serves
//! its binder until the interpreter reaches a terminal state.

use chord_machine::binder::{EchoPortHandler, GrpcBinder, RemotingService};
use chord_machine::config::{Cli, MachineConfig};
use chord_machine::registration;
use chord_machine::runner::{LocalMachine, StubInterpreter};
use chord_core::ChordError;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match MachineConfig::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("chord-machine: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&config);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("chord-machine: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(exit_status) if exit_status == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("chord-machine exiting: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &MachineConfig) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path).ok()?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn run(config: MachineConfig) -> Result<i64, ChordError> {
    let binder_location = GrpcBinder::default_location(&config.run_directory, &config.machine_server_name)?;
    let binder_endpoint_url = binder_location.to_url();

    let pending = registration::sign_certificates(&config, &binder_endpoint_url).await?;

    let machine = LocalMachine::spawn(StubInterpreter, config.start_suspended);
    let monitor = machine.monitor();
    let service = RemotingService::new(Arc::clone(&machine));
    for protocol_url in &config.expected_ports {
        service.register_handler(protocol_url.clone(), true, Arc::new(EchoPortHandler));
    }

    let (binder, accept_loop) = GrpcBinder::bind(
        &binder_location,
        &config.ca_bundle_pem,
        pending.cert_pem(),
        pending.identity().key_pem(),
        Arc::clone(&service),
    )
    .await?;
    tokio::spawn(accept_loop);

    // Only now does the binder actually accept connections; tell the agent
    // it's bound so `RunMachine`'s waiter (and anything it unblocks, like
    // the isolate dialing straight in) can't race ahead of the listener.
    pending.advertise_bound(&binder_endpoint_url).await?;

    tracing::info!(
        endpoint = %binder.endpoint_url(),
        machine_url = %config.machine_url,
        main_location = %config.main_location,
        "chord-machine ready"
    );

    // No required-at-launch plugs to gate on: nothing will ever call
    // notify_init_complete, so honor start_suspended/resume here directly.
    if config.expected_ports.is_empty() {
        machine.notify_init_complete();
    }

    Ok(monitor.wait_for_exit().await)
}
