use clap::Parser;
use kafs_user::afslog::unlog;
use kafs_user::keyring::TokenStore;
use kafs_user::procfs::AfsProc;
use std::process::ExitCode;
use tracing::{info, Level};

#[derive(Debug, clap::Parser)]
#[clap(about = "Destroy either all AFS tokens or the AFS tokens of the given cells.")]
struct OptParser {
    /// Be more verbose.
    #[clap(short, long)]
    debug: bool,
    cells: Vec<String>,
}

fn main() -> ExitCode {
    let opt = OptParser::parse();

    tracing_subscriber::fmt()
        .with_max_level(if opt.debug { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    if !AfsProc::default().has_afs_support() {
        eprintln!("unlog: AFS does not seem to be present on this machine");
        return ExitCode::from(1);
    }

    let mut tokens = TokenStore::kernel();
    let mut failed: usize = 0;

    for cell in opt.cells.iter() {
        info!(%cell, "Unlogging from cell");
        if let Err(err) = unlog(&mut tokens, Some(cell)) {
            eprintln!("unlog: {cell}: {err:?}");
            failed += 1;
        }
    }

    if opt.cells.is_empty() {
        info!("Unlogging from all cells");
        if let Err(err) = unlog(&mut tokens, None) {
            eprintln!("unlog: {err:?}");
            failed += 1;
        }
    }

    ExitCode::from(u8::try_from(failed).unwrap_or(u8::MAX))
}
