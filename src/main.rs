use std::{
    io::{self, BufRead, Read, Write},
    net::{TcpStream as StdTcpStream, ToSocketAddrs},
    os::unix::io::AsRawFd,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::{AppSettings, Parser};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, info};
use mio::{net::TcpStream, unix::SourceFd, Events, Interest, Poll, Token};

use atvis::{
    codec::ResponseMessage,
    generate_client_id,
    net::{FramedStream, ReadStatus},
    setup_logging,
    viewer::{
        panels::{DumpFormat, SummaryRenderer},
        ViewerError, ViewerSession,
    },
    DEFAULT_PORT,
};

const STDIN: Token = Token(0);
const SERVER: Token = Token(1);
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
/// Bigger than stdin's own buffer, so reads go straight to the terminal.
const STDIN_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_long_args = true)]
struct Args {
    /// The host running atvis-server.
    #[clap(short, long, default_value = "localhost")]
    server: String,

    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Show this dump file instead of connecting to a server.
    #[clap(short, long)]
    file: Option<PathBuf>,

    /// The name other viewers see when you change the options.
    #[clap(short, long)]
    username: Option<String>,

    /// The format of files written by the "dump" command (text or csv).
    #[clap(long, default_value = "text")]
    dump_format: DumpFormat,

    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    verbosity: u8,
}

fn main() {
    if let Err(e) = try_main() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<(), ViewerError> {
    let args = Args::parse();
    setup_logging(args.verbosity);

    let mut session = ViewerSession::new(generate_client_id()).with_dump_format(args.dump_format);
    if let Some(name) = &args.username {
        session = session.with_username(name);
    }
    debug!("Client id {}", session.client_id());

    match &args.file {
        Some(file) => {
            session.load_dump(file)?;
            offline(session)
        }
        None => online(session, &args.server, args.port),
    }
}

fn show(session: &mut ViewerSession) {
    for line in session.take_status() {
        println!("{line}");
    }
}

fn prompt(session: &ViewerSession) {
    print!("{}", session.prompt());
    let _ = io::stdout().flush();
}

/// Work on a dump file. There's no server, so anything that needs one is
/// dropped.
fn offline(mut session: ViewerSession) -> Result<(), ViewerError> {
    let mut renderer = SummaryRenderer::new(io::stdout());
    session.process_pending(&mut renderer)?;
    show(&mut session);
    prompt(&session);
    for line in io::stdin().lock().lines() {
        session.handle_line(&line?);
        session.process_pending(&mut renderer)?;
        for r in session.take_requests() {
            debug!("No server for {:?}", r.request);
        }
        show(&mut session);
        if session.should_quit() {
            return Ok(());
        }
        prompt(&session);
    }
    Ok(())
}

fn online(mut session: ViewerSession, host: &str, port: u16) -> Result<(), ViewerError> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{host} has no address")))?;
    info!("Connecting to {addr}");
    let stream = StdTcpStream::connect(addr)?;
    stream.set_nonblocking(true)?;
    let mut server = FramedStream::new(TcpStream::from_std(stream));

    let interrupted = Arc::new(AtomicCell::new(false));
    {
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || interrupted.store(true))?;
    }

    let mut poll = Poll::new()?;
    let stdin_fd = io::stdin().as_raw_fd();
    poll.registry()
        .register(&mut SourceFd(&stdin_fd), STDIN, Interest::READABLE)?;
    poll.registry().register(
        server.get_mut(),
        SERVER,
        Interest::READABLE | Interest::WRITABLE,
    )?;

    let mut renderer = SummaryRenderer::new(io::stdout());
    let mut events = Events::with_capacity(16);
    let mut typed = String::new();
    let mut chunk = vec![0; STDIN_CHUNK];
    let mut server_gone = false;
    session.start();

    while !interrupted.load() && !session.should_quit() {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }

        let mut reprompt = false;
        for event in events.iter() {
            match event.token() {
                STDIN => {
                    let n = io::stdin().read(&mut chunk)?;
                    if n == 0 {
                        session.quit();
                    }
                    typed.push_str(&String::from_utf8_lossy(&chunk[..n]));
                    while let Some(end) = typed.find('\n') {
                        let line: String = typed.drain(..=end).collect();
                        session.handle_line(line.trim_end());
                    }
                    reprompt = true;
                }
                SERVER if !server_gone => {
                    let status = server.read_available()?;
                    while let Some(m) = server.next_message::<ResponseMessage>()? {
                        session.handle_response(m);
                    }
                    if status == ReadStatus::Closed {
                        debug!("The server hung up");
                        server_gone = true;
                        session.server_closed();
                    }
                }
                _ => (),
            }
        }

        session.process_pending(&mut renderer)?;
        if server_gone {
            for r in session.take_requests() {
                debug!("No server for {:?}", r.request);
            }
        } else {
            for r in session.take_requests() {
                server.queue(&r)?;
            }
            server.flush()?;
        }

        let status = session.take_status();
        if !status.is_empty() {
            println!();
            for line in status {
                println!("{line}");
            }
            reprompt = true;
        }
        if reprompt && !session.should_quit() {
            prompt(&session);
        }
    }
    println!();
    Ok(())
}
