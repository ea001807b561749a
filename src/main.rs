use std::io::ErrorKind;
use std::process::exit;
use std::sync::Arc;

use clap::Arg;
use clap::ArgAction;
use clap::Command;
use clap::crate_version;
use fuser::MountOption;
use log::LevelFilter;
use log::error;

use ftpfs::Config;
use ftpfs::FtpFs;
use ftpfs::SharedConnection;

fn main() {
    let matches = Command::new("ftpfs")
        .version(crate_version!())
        .about("Mount a remote FTP server as a local filesystem")
        .arg(
            Arg::new("host")
                .value_name("HOST")
                .required(true)
                .help("Server to mount: [ftp://][user[:pass]@]host[:port][/dir]"),
        )
        .arg(
            Arg::new("mountpoint")
                .value_name("MOUNT_POINT")
                .required(true)
                .help("Where to mount the remote tree"),
        )
        .arg(
            Arg::new("options")
                .short('o')
                .value_name("OPT[,OPT...]")
                .action(ArgAction::Append)
                .help("Mount options (see the recognized-option list in the README)"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .get_matches();

    let options: Vec<String> = matches
        .get_many::<String>("options")
        .unwrap_or_default()
        .flat_map(|group| group.split(','))
        .map(str::to_string)
        .collect();

    let host = matches.get_one::<String>("host").expect("required");
    let config = match Config::from_args(host, options.iter().map(String::as_str)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ftpfs: {err}");
            exit(1);
        }
    };

    let verbosity = matches.get_count("v");
    let log_level = if config.verbose && verbosity == 0 {
        LevelFilter::Debug
    } else {
        match verbosity {
            0 => LevelFilter::Error,
            1 => LevelFilter::Warn,
            2 => LevelFilter::Info,
            3 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    env_logger::builder().filter_level(log_level).init();

    let mountpoint = matches
        .get_one::<String>("mountpoint")
        .expect("required")
        .to_string();

    let config = Arc::new(config);
    let conn = match SharedConnection::connect(Arc::clone(&config)) {
        Ok(conn) => Arc::new(conn),
        Err(err) => {
            error!("cannot reach {}: {err}", config.host.host);
            exit(1);
        }
    };

    let mut mount_options = vec![
        MountOption::FSName(format!("ftpfs#{}", config.host.host)),
        MountOption::Subtype("ftpfs".to_string()),
    ];
    mount_options.extend(config.fuse_options.iter().cloned());

    let fs = FtpFs::new(conn, Arc::clone(&config));
    if let Err(err) = fuser::mount2(fs, &mountpoint, &mount_options) {
        // permission denied usually means user_allow_other is missing from
        // /etc/fuse.conf
        if err.kind() == ErrorKind::PermissionDenied {
            error!("{err}");
            exit(2);
        }
        error!("{err}");
        exit(1);
    }
}
