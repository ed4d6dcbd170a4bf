//! trellis: a CNI meta-plugin that delegates a sandbox's network
//! attachments to other CNI plugins.
//!
//! Stdout carries the CNI result and error documents; all logging goes to
//! stderr.

use std::panic::{self, AssertUnwindSafe};
use std::process::ExitCode;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use trellis_common::{CniErrorReply, Error};

mod skel;

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "trellis invoked");

    // The runtime must never see a bare panic: every outcome, including an
    // unrecovered fault, is reported as a structured error object.
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            tracing::error!(error = %err, code = err.cni_code(), "command failed");
            print_error(&err);
            ExitCode::FAILURE
        }
        Err(payload) => {
            let err = Error::Internal(panic_message(payload));
            tracing::error!(error = %err, "unrecovered fault");
            print_error(&err);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run() -> trellis_common::Result<()> {
    if let Some(output) = skel::run().await? {
        println!("{}", output);
    }
    Ok(())
}

fn print_error(err: &Error) {
    let reply = CniErrorReply::from_error(err, skel::CNI_VERSION);
    match serde_json::to_string(&reply) {
        Ok(json) => println!("{}", json),
        Err(_) => println!(r#"{{"code": 999, "msg": "internal error"}}"#),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
