use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use clap::{AppSettings, Parser};
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::info;

use atvis::{
    codec::{write_dump, Dump},
    server::{Server, ServerError, SessionHub},
    setup_logging, ServerType, DEFAULT_PORT,
};

#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// The archives to serve, in time order.
    #[clap(required = true)]
    data: Vec<PathBuf>,

    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Tell viewers the data come from a simulator.
    #[clap(long)]
    simulator: bool,

    /// Write the reduced data to this dump file and exit instead of serving.
    #[clap(long)]
    dump: Option<PathBuf>,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,

    /// Disable progress bars.
    #[clap(long)]
    no_progress_bars: bool,
}

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), ServerError> {
    let args = Args::parse();
    setup_logging(args.verbosity);

    let progress = ProgressBar::with_draw_target(
        Some(args.data.len() as _),
        if args.no_progress_bars {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stdout()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg:17}: [{wide_bar:.blue}] {pos:2}/{len:2} files ({elapsed_precise}<{eta_precise})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    )
    .with_position(0);

    let server_type = if args.simulator {
        ServerType::Simulator
    } else {
        ServerType::RealInstrument
    };
    let hub = SessionHub::new(args.data, server_type, Some(progress))?;

    if let Some(path) = &args.dump {
        write_dump(path, &Dump::Vis((**hub.snapshot()).clone()))?;
        info!("Wrote {}", path.display());
        return Ok(());
    }

    let shutdown = Arc::new(AtomicCell::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true))?;
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let mut server = Server::bind(hub, addr)?;
    server.run(&shutdown)
}
