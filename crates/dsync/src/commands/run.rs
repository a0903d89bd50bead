//! `dsync run`: stream system events until interrupted.

use std::io::Write;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;

pub async fn handle(args: &RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (engine, mut events) = super::start_engine(global, &args.bus).await?;

    let deadline = async {
        match args.duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let result = loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break Ok(());
            }
            () = &mut deadline => break Ok(()),
            event = events.recv() => match event {
                Ok(event) => {
                    let line = serde_json::to_string(&*event)?;
                    let mut stdout = std::io::stdout().lock();
                    writeln!(stdout, "{line}")?;
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event output fell behind"),
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    engine.shutdown().await;
    // Events released by the final flush.
    while let Ok(event) = events.try_recv() {
        println!("{}", serde_json::to_string(&*event)?);
    }
    result
}
