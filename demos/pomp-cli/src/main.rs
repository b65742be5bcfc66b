//! Interop test tool for the protocol: a small client/server/dgram/dump
//! harness driven from the command line, grounded on the `-s/-c/-u/-d/-t/-w`
//! surface of the reference implementation's `pomp-cli` sample.

use std::{
    cell::Cell,
    process::ExitCode,
    rc::Rc,
    time::{Duration, Instant},
};

use clap::Parser;
use pomp_core::{
    addr::Addr,
    codec::{Decoder, Value},
    error::{PompError, Result},
};
use pomp_loop::event_loop::Loop;
use pomp_net::{Context, ContextConfig, CtxEvent};
use tracing_subscriber::EnvFilter;

/// Maximum length of a dumped message, matching the reference tool's fixed
/// dump buffer.
const DUMP_MAX_LEN: usize = 256;

#[derive(Parser)]
#[command(name = "pomp-cli", about = "Exchange or dump protocol messages over a given address")]
struct Cli {
    /// Act as a server (default: client).
    #[arg(short = 's', long)]
    server: bool,

    /// Act as a client (default if neither -s nor -u is given).
    #[arg(short = 'c', long)]
    client: bool,

    /// Use a datagram (connectionless) socket instead of a stream.
    #[arg(short = 'u', long)]
    udp: bool,

    /// Dump received messages instead of decoding them against `format`.
    #[arg(short = 'd', long)]
    dump: bool,

    /// Stop after this many seconds (default: run until interrupted).
    #[arg(short = 't', long = "timeout", value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Wait for a message with this id before exiting successfully.
    #[arg(short = 'w', long = "wait", value_name = "MSGID")]
    wait_for: Option<u32>,

    /// Address to listen on (server/dgram) or connect to (client), e.g.
    /// `inet:127.0.0.1:4567` or `unix:/tmp/pomp.sock`.
    addr: String,

    /// Destination address for a `-u` dgram send (client side only).
    to_addr: Option<String>,

    /// Message id to send. Omit to only receive.
    msgid: Option<u32>,

    /// printf-style format string describing `argv`'s types.
    format: Option<String>,

    /// Values to encode per `format`, e.g. `%i%s` with argv `["42", "hi"]`.
    argv: Vec<String>,
}

enum Role {
    Server,
    Client,
    Dgram,
}

fn role(cli: &Cli) -> Result<Role> {
    match (cli.server, cli.udp, cli.client) {
        (true, true, _) => Err(PompError::InvalidArgument("-s and -u are mutually exclusive")),
        (true, false, _) => Ok(Role::Server),
        (false, true, _) => Ok(Role::Dgram),
        (false, false, _) => Ok(Role::Client),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "pomp-cli failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let role = role(&cli)?;
    let addr = Addr::parse(&cli.addr)?;
    let to_addr = cli.to_addr.as_deref().map(Addr::parse).transpose()?;

    let deadline = cli.timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
    let wait_for = cli.wait_for;
    let satisfied = Rc::new(Cell::new(wait_for.is_none()));
    let dump = cli.dump;

    let loop_ = Loop::new()?;
    let cfg = ContextConfig::default();

    let event_cb = {
        let satisfied = satisfied.clone();
        Box::new(move |ctx: &mut Context, fd, ev| on_event(ctx, fd, ev, dump, wait_for, &satisfied))
    };

    let mut ctx = match role {
        Role::Server => {
            let mut ctx = Context::server(loop_, addr, cfg, event_cb);
            ctx.listen()?;
            ctx
        }
        Role::Client => {
            let mut ctx = Context::client(loop_, addr, cfg, event_cb);
            ctx.connect()?;
            ctx
        }
        Role::Dgram => {
            let mut ctx = Context::dgram(loop_, addr, cfg, event_cb);
            ctx.bind()?;
            ctx
        }
    };

    if let Some(msgid) = cli.msgid {
        let fmt = cli.format.as_deref().unwrap_or("");
        let argv: Vec<&str> = cli.argv.iter().map(String::as_str).collect();
        let mut enc = pomp_core::codec::Encoder::new(msgid);
        enc.write_argv(fmt, &argv)?;
        let msg = enc.finish()?;
        match &to_addr {
            Some(to) => ctx.send_msg_to(&msg, to)?,
            None => ctx.send_msg(msg)?,
        }
    }

    loop {
        if wait_for.is_some() && satisfied.get() {
            return Ok(());
        }

        let poll_for = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return if wait_for.is_some() { Err(PompError::TimedOut) } else { Ok(()) };
                }
                Some(deadline - now)
            }
            // `wait_and_process` itself caps an unbounded wait at one
            // second so this loop keeps re-checking `deadline`/`satisfied`.
            None => None,
        };
        ctx.wait_and_process(poll_for)?;
    }
}

fn on_event(_ctx: &mut Context, fd: i32, ev: CtxEvent<'_>, dump: bool, wait_for: Option<u32>, satisfied: &Rc<Cell<bool>>) {
    match ev {
        CtxEvent::Connected => {
            tracing::info!(fd, "connected");
        }
        CtxEvent::Disconnected => {
            tracing::info!(fd, "disconnected");
        }
        CtxEvent::Msg(msg) => {
            if dump {
                let dec = Decoder::new(msg);
                match dec.dump(msg.id(), DUMP_MAX_LEN) {
                    Ok(s) => println!("{s}"),
                    Err(e) => tracing::warn!(error = %e, "dump failed"),
                }
            } else {
                let mut dec = Decoder::new(msg);
                let values = decode_all(&mut dec);
                println!("msgid={} values={values:?}", msg.id());
            }
            if Some(msg.id()) == wait_for {
                satisfied.set(true);
            }
        }
    }
}

/// Reads whatever arguments are present without a caller-supplied format
/// string, for the common "just show me what came in" CLI path.
fn decode_all(dec: &mut Decoder) -> Vec<Value> {
    let mut out = Vec::new();
    while !dec.is_empty() {
        match dec.read_any(true) {
            Ok(v) => out.push(v),
            Err(_) => break,
        }
    }
    out
}
