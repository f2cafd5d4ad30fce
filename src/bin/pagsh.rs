use clap::Parser;
use kafs_user::keyring::TokenStore;
use kafs_user::procfs::AfsProc;
use std::env;
use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitCode};
use tracing::{debug, error, Level};

#[derive(Debug, clap::Parser)]
#[clap(about = "Start a new shell or command in a new PAG (process authentication group).")]
struct OptParser {
    /// Be more verbose.
    #[clap(short, long)]
    debug: bool,
    /// Join a shared PAG rather than a local one.
    #[clap(short, long)]
    shared: bool,
    /// Run the command through `/bin/sh -c`.
    #[clap(short = 'c')]
    command: bool,
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let opt = OptParser::parse();

    tracing_subscriber::fmt()
        .with_max_level(if opt.debug { Level::DEBUG } else { Level::WARN })
        .with_writer(std::io::stderr)
        .init();

    let (path, args) = match opt.args.split_first() {
        Some((path, args)) => (path.clone(), args.to_vec()),
        None => (
            env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            Vec::new(),
        ),
    };

    if AfsProc::default().has_afs_support() {
        let mut tokens = TokenStore::kernel();
        debug!(current = ?tokens.current_pag_kind(), "current PAG");
        if let Err(err) = tokens.join_pag(opt.shared) {
            error!(?err, "Unable to create PAG");
        }
    }

    let arg0 = Path::new(&path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.clone());

    let mut err = None;
    if !opt.command {
        let e = Command::new(&path).arg0(&arg0).args(&args).exec();
        if e.kind() != ErrorKind::NotFound {
            eprintln!("pagsh: {path}: {e}");
            return ExitCode::from(1);
        }
        err = Some(e);
    }

    debug!(?err, %path, "running through /bin/sh");
    let e = Command::new("/bin/sh")
        .arg0("sh")
        .arg("-c")
        .arg(&path)
        .args(&args)
        .exec();
    eprintln!("pagsh: /bin/sh: {e}");
    ExitCode::from(1)
}
