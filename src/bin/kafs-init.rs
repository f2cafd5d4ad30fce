use clap::Parser;
use kafs_user::cells::{CellConfig, CellRecord};
use kafs_user::procfs::AfsProc;
use kafs_user::KafsError;
use std::process::ExitCode;
use tracing::{debug, Level};

#[derive(Debug, clap::Parser)]
#[clap(about = "Load the configured cells and the root cell into kAFS.")]
struct OptParser {
    /// Be more verbose.
    #[clap(short, long)]
    debug: bool,
}

fn main() -> ExitCode {
    let opt = OptParser::parse();

    tracing_subscriber::fmt()
        .with_max_level(if opt.debug { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    let afs = AfsProc::default();
    if !afs.has_afs_support() {
        eprintln!("kafs-init: AFS does not seem to be present on this machine");
        return ExitCode::from(1);
    }

    let config = CellConfig::default();
    let cells = match config.default_cell_set() {
        Ok(cells) => cells,
        Err(KafsError::NoCells) => {
            debug!("no cells configured");
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            eprintln!("kafs-init: {err:?}");
            return ExitCode::from(1);
        }
    };

    let servers = match config.cell_servers() {
        Ok(servers) => servers,
        Err(err) => {
            eprintln!("kafs-init: Unable to read the cell database: {err:?}");
            return ExitCode::from(1);
        }
    };

    let records: Vec<CellRecord> = servers
        .into_iter()
        .filter(|record| cells.contains(&record.name) && !record.vls.is_empty())
        .collect();

    if let Err(err) = afs.populate_cell_database(&records) {
        eprintln!("kafs-init: Some cell was not written into the kAFS cell database: {err:?}");
        return ExitCode::from(1);
    }

    // The kernel refuses a root cell it does not know yet.
    if let Some(cell) = config.this_cell() {
        if let Err(err) = afs.set_root_cell(&cell) {
            eprintln!("kafs-init: Unable to set root cell {cell}: {err:?}");
            return ExitCode::from(1);
        }
    }

    ExitCode::SUCCESS
}
