use clap::Parser;
use kafs_user::afslog::list;
use kafs_user::keyring::TokenStore;
use kafs_user::procfs::AfsProc;
use std::process::ExitCode;
use tracing::Level;

#[derive(Debug, clap::Parser)]
#[clap(about = "List the AFS tokens of this session.")]
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

    if !AfsProc::default().has_afs_support() {
        eprintln!("tokens: AFS does not seem to be present on this machine");
        return ExitCode::from(1);
    }

    let tokens = TokenStore::kernel();
    let listing = match list(&tokens) {
        Ok(listing) => listing,
        Err(err) => {
            eprintln!("tokens: Unable to list tokens: {err:?}");
            return ExitCode::from(1);
        }
    };

    let mut count = 0;
    for token in listing {
        if count == 0 {
            println!("# Token                        Expire");
            println!("# ---------------------------- ------");
        }
        println!("{:<30} {:>6}", token.name, token.expiry);
        count += 1;
    }

    if count == 0 {
        println!(">> NO AFS TOKENS");
    }

    ExitCode::SUCCESS
}
