//! A minimal manual-testing client: connect to a chain server over TCP
//! or a Unix socket and issue one read/write/flush operation.
//!
//! Wraps [`nbd_chain::client::Client`] — there is no kernel-attach mode
//! here (unlike a classic NBD client), since driving the in-kernel
//! `/dev/nbd*` device is client-side NBD behavior this crate's server
//! doesn't concern itself with.

use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use nbd_chain::client::Client;

/// Issue a single NBD request against a running chain server.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// host:port to connect to, unless --unix is given.
    #[arg(long, default_value = "127.0.0.1:10809")]
    host: String,

    /// Connect to a Unix domain socket instead of TCP.
    #[arg(long)]
    unix: Option<PathBuf>,

    /// Name of the export to request.
    #[arg(long, default_value = "")]
    export_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the export's size, as reported during the handshake.
    Size,
    /// Read `len` bytes at `offset` and print them as hex to stdout.
    Read { offset: u64, len: u32 },
    /// Write hex-encoded `data` at `offset`.
    Write { offset: u64, data: String },
    /// Send a flush command.
    Flush,
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        color_eyre::eyre::bail!("hex data must have an even number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).wrap_err("invalid hex digit"))
        .collect()
}

fn run<IO: std::io::Read + std::io::Write>(stream: IO, args: &Args) -> Result<()> {
    let mut client = Client::new(stream, &args.export_name)?;
    match &args.command {
        Command::Size => println!("{}", client.size()),
        Command::Read { offset, len } => {
            let data = client.read(*offset, *len)?;
            println!(
                "{}",
                data.iter().map(|b| format!("{b:02x}")).collect::<String>()
            );
        }
        Command::Write { offset, data } => {
            client.write(*offset, &parse_hex(data)?)?;
        }
        Command::Flush => client.flush()?,
    }
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();
    let args = Args::parse();

    if let Some(path) = &args.unix {
        let stream = UnixStream::connect(path)
            .wrap_err_with(|| format!("connecting to {}", path.display()))?;
        run(stream, &args)
    } else {
        let stream = TcpStream::connect(&args.host)
            .wrap_err_with(|| format!("connecting to {}", args.host))?;
        run(stream, &args)
    }
}
