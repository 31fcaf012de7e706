//! CLI smoke and diagnostics entry point.
//!
//! # Responsibility
//! - Verify `tidemark_core` linkage with deterministic output.
//! - Print per-collection record and pending counts of a local database.
//!
//! Usage: `tidemark [status <db_path>] [--log-dir <absolute_dir>]`

use log::info;
use std::process::ExitCode;
use std::sync::Arc;
use tidemark_core::{
    BlobRepository, Collection, Note, SqliteBlobRepository, StoreResult, SyncRecord, Task,
    TaskBoard,
};

fn main() -> ExitCode {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    if let Some(index) = args.iter().position(|arg| arg == "--log-dir") {
        let Some(dir) = args.get(index + 1).cloned() else {
            eprintln!("--log-dir requires a directory");
            return ExitCode::from(2);
        };
        args.drain(index..=index + 1);
        if let Err(err) = tidemark_core::init_logging(tidemark_core::default_log_level(), &dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    println!("tidemark_core ping={}", tidemark_core::ping());
    println!("tidemark_core version={}", tidemark_core::core_version());

    match args.as_slice() {
        [] => ExitCode::SUCCESS,
        [command, db_path] if command == "status" => match print_status(db_path) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("status failed: {err}");
                ExitCode::FAILURE
            }
        },
        _ => {
            eprintln!("usage: tidemark [status <db_path>] [--log-dir <absolute_dir>]");
            ExitCode::from(2)
        }
    }
}

fn print_status(db_path: &str) -> StoreResult<()> {
    let blobs: Arc<dyn BlobRepository> = Arc::new(SqliteBlobRepository::open(db_path)?);
    info!("event=cli_status module=cli status=start");
    print_collection::<TaskBoard>(&blobs)?;
    print_collection::<Task>(&blobs)?;
    print_collection::<Note>(&blobs)?;
    info!("event=cli_status module=cli status=ok");
    Ok(())
}

fn print_collection<R: SyncRecord>(blobs: &Arc<dyn BlobRepository>) -> StoreResult<()> {
    let collection = Collection::<R>::load(Arc::clone(blobs))?;
    let active = collection.list(|record| record.is_active()).len();
    println!(
        "{} records={} active={} pending={} last_sync_at={}",
        collection.name(),
        collection.len(),
        active,
        collection.pending_len(),
        collection.last_sync_at()
    );
    Ok(())
}
