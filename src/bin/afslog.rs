use clap::Parser;
use kafs_user::afslog::{afslog, afslog_cell};
use kafs_user::ccache::Krb5Context;
use kafs_user::cells::CellConfig;
use kafs_user::keyring::TokenStore;
use kafs_user::procfs::AfsProc;
use kafs_user::profile::Profile;
use std::process::ExitCode;
use tracing::{info, Level};

#[derive(Debug, clap::Parser)]
#[clap(
    about = "Obtain AFS tokens. If no cell names are given, they are read from ThisCell and TheseCells."
)]
struct OptParser {
    /// Be more verbose.
    #[clap(short, long)]
    debug: bool,
    /// The realm of the AFS servers, instead of the one each cell maps to.
    #[clap(short, long)]
    realm: Option<String>,
    /// Credential cache to take tickets from.
    #[clap(short, long)]
    cache: Option<String>,
    cells: Vec<String>,
}

fn main() -> ExitCode {
    let opt = OptParser::parse();

    tracing_subscriber::fmt()
        .with_max_level(if opt.debug { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    if !AfsProc::default().has_afs_support() {
        eprintln!("afslog: AFS does not seem to be present on this machine");
        return ExitCode::from(1);
    }

    let profile = match Profile::load() {
        Ok(profile) => profile,
        Err(err) => {
            eprintln!("afslog: Unable to load krb5 configuration: {err:?}");
            return ExitCode::from(1);
        }
    };

    let cache = match &opt.cache {
        Some(name) => profile.resolve_cache(name),
        None => profile.default_cache(),
    };
    let cache = match cache {
        Ok(cache) => cache,
        Err(err) => {
            eprintln!("afslog: Unable to open credential cache: {err:?}");
            return ExitCode::from(1);
        }
    };

    let mut tokens = TokenStore::kernel();
    let realm = opt.realm.as_deref();
    let mut failed: usize = 0;

    for cell in opt.cells.iter() {
        info!(%cell, "Getting tokens for cell");
        if let Err(err) = afslog_cell(&profile, cache.as_ref(), &mut tokens, cell, realm) {
            eprintln!("afslog: {cell}: {err:?}");
            failed += 1;
        }
    }

    if opt.cells.is_empty() {
        info!("Getting tokens for default cells");
        let cells = CellConfig::default();
        if let Err(err) = afslog(&profile, cache.as_ref(), &mut tokens, &cells, None, realm) {
            eprintln!("afslog: {err:?}");
            failed += 1;
        }
    }

    ExitCode::from(u8::try_from(failed).unwrap_or(u8::MAX))
}
