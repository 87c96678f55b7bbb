//! Command-line entry point: assemble a chain from `--filter`/`--plugin`
//! flags, bind the configured transport(s), and serve connections.
//!
//! This is deliberately thin — it's the ambient CLI a chain needs to run
//! at all, not a reimplementation of any particular plugin/filter's own
//! configuration grammar. Each `--filter`/`--plugin` value is just
//! `name[:config]`, parsed by [`parse_filter`]/[`parse_plugin`] below.

use std::fs::File;
use std::io::BufReader;
use std::net::ToSocketAddrs as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use log::info;

use nbd_chain::chain::filters::{
    IndexedDecompressFilter, ReadOnlyFilter, RemapFilter, RotationalFilter,
};
use nbd_chain::chain::filters::remap::Rule;
use nbd_chain::chain::plugin::{DevicePlugin, FilePlugin, MemoryPlugin};
use nbd_chain::chain::{ChainBuilder, Layer};
use nbd_chain::server::Server;
use nbd_chain::size;
use nbd_chain::transport::{accept_loop, Endpoint, Listener};

/// Serve an NBD export through a configurable chain of filters over a
/// plugin.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TCP host to listen on, unless --unix, --vsock or --stdin is given.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// TCP port to listen on.
    #[arg(long, default_value_t = nbd_chain::proto::TCP_PORT)]
    port: u16,

    /// Listen on a Unix domain socket instead of TCP.
    #[arg(long, conflicts_with_all = ["vsock", "stdin"])]
    unix: Option<PathBuf>,

    /// Listen on a VSOCK address `cid:port` instead of TCP.
    #[arg(long, conflicts_with_all = ["unix", "stdin"])]
    vsock: Option<String>,

    /// Serve a single connection already attached to stdin/stdout.
    #[arg(long, conflicts_with_all = ["unix", "vsock"])]
    stdin: bool,

    /// A filter to push onto the chain, closest-to-client first. May be
    /// repeated; each one is `name[:config]`. Recognized names: readonly,
    /// rotational[:true|false], map:RULES (RULES is a comma-separated list
    /// of `start-end=dest`, lowest priority first), indexed_decompress[:PATH].
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// The terminal plugin: memory:SIZE, file:PATH or device:PATH.
    #[arg(long, default_value = "memory:64M")]
    plugin: String,

    /// Name of the export to advertise (most clients don't care).
    #[arg(long, default_value = "")]
    export_name: String,

    /// Force every connection read-only regardless of the plugin.
    #[arg(long)]
    readonly: bool,

    /// Directory containing cert.pem/key.pem to offer STARTTLS with.
    #[arg(long)]
    tls_cert_dir: Option<PathBuf>,

    /// Idle-connection timeout (accepts the same size-suffix grammar as
    /// plugin sizes, interpreted as a whole number of seconds).
    #[arg(long)]
    timeout: Option<String>,

    /// Increase log verbosity (repeatable).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease log verbosity.
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn parse_filter(spec: &str) -> Result<Arc<dyn Layer>> {
    let (name, config) = match spec.split_once(':') {
        Some((name, config)) => (name, Some(config)),
        None => (spec, None),
    };
    let layer: Arc<dyn Layer> = match name {
        "readonly" => Arc::new(ReadOnlyFilter::new()),
        "rotational" => {
            let rotational = match config {
                Some(v) => v
                    .parse::<bool>()
                    .wrap_err_with(|| format!("invalid rotational value {v:?}"))?,
                None => true,
            };
            Arc::new(RotationalFilter::new(rotational))
        }
        "map" => {
            let config = config.ok_or_else(|| {
                color_eyre::eyre::eyre!("map filter needs a rule list, e.g. map:0-99=1000")
            })?;
            Arc::new(RemapFilter::new(&parse_map_rules(config)?))
        }
        "indexed_decompress" => {
            let filter = IndexedDecompressFilter::new(config.map(PathBuf::from));
            Arc::new(filter)
        }
        other => bail!("unknown filter {other:?}"),
    };
    Ok(layer)
}

fn parse_map_rules(config: &str) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();
    for clause in config.split(',') {
        let (range, dest) = clause
            .split_once('=')
            .ok_or_else(|| color_eyre::eyre::eyre!("invalid map rule {clause:?}, want start-end=dest"))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| color_eyre::eyre::eyre!("invalid map range {range:?}, want start-end"))?;
        let start: u64 = start.trim().parse().wrap_err("invalid map range start")?;
        let end: u64 = end.trim().parse().wrap_err("invalid map range end")?;
        let dest: u64 = dest.trim().parse().wrap_err("invalid map rule destination")?;
        rules.push(Rule { start, end, dest });
    }
    Ok(rules)
}

fn parse_plugin(spec: &str) -> Result<Arc<dyn Layer>> {
    let (name, config) = spec
        .split_once(':')
        .ok_or_else(|| color_eyre::eyre::eyre!("plugin needs a config, e.g. memory:64M"))?;
    let layer: Arc<dyn Layer> = match name {
        "memory" => {
            let size = size::parse(config).map_err(|e| color_eyre::eyre::eyre!("{e}"))?;
            if size < 0 {
                bail!("memory plugin size must not be negative");
            }
            Arc::new(MemoryPlugin::new(vec![0u8; size as usize], true))
        }
        "file" => Arc::new(FilePlugin::new(config, true)),
        "device" => Arc::new(DevicePlugin::new(config, true)),
        other => bail!("unknown plugin {other:?}"),
    };
    Ok(layer)
}

fn parse_vsock(spec: &str) -> Result<Endpoint> {
    let (cid, port) = spec
        .split_once(':')
        .ok_or_else(|| color_eyre::eyre::eyre!("--vsock wants cid:port"))?;
    Ok(Endpoint::Vsock {
        cid: cid.trim().parse().wrap_err("invalid vsock cid")?,
        port: port.trim().parse().wrap_err("invalid vsock port")?,
    })
}

fn load_tls(dir: &PathBuf) -> Result<Arc<rustls::ServerConfig>> {
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(
        File::open(&cert_path).wrap_err_with(|| format!("opening {}", cert_path.display()))?,
    ))
    .collect::<std::result::Result<_, _>>()
    .wrap_err_with(|| format!("parsing {}", cert_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(&key_path).wrap_err_with(|| format!("opening {}", key_path.display()))?,
    ))
    .wrap_err_with(|| format!("parsing {}", key_path.display()))?
    .ok_or_else(|| color_eyre::eyre::eyre!("no private key found in {}", key_path.display()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .wrap_err("building TLS server config")?;
    Ok(Arc::new(config))
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let level = if args.quiet {
        log::LevelFilter::Warn
    } else {
        match args.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::new().filter_level(level).init();

    let mut builder = ChainBuilder::new();
    for spec in &args.filters {
        builder = builder.push(parse_filter(spec)?);
    }
    builder = builder.push(parse_plugin(&args.plugin)?);
    let chain = Arc::new(builder.build().map_err(|e| color_eyre::eyre::eyre!("{e}"))?);
    info!("chain thread model: {:?}", chain.thread_model());

    let endpoint = if args.stdin {
        Endpoint::Stdin
    } else if let Some(path) = &args.unix {
        Endpoint::Unix(path.clone())
    } else if let Some(spec) = &args.vsock {
        parse_vsock(spec)?
    } else {
        // Resolve eagerly so a bad hostname fails before we bind.
        (args.host.as_str(), args.port)
            .to_socket_addrs()
            .wrap_err("resolving --host")?;
        Endpoint::Tcp {
            host: args.host.clone(),
            port: args.port,
        }
    };

    let tls_config = args.tls_cert_dir.as_ref().map(load_tls).transpose()?;
    let timeout = args
        .timeout
        .as_deref()
        .map(size::parse)
        .transpose()
        .map_err(|e| color_eyre::eyre::eyre!("{e}"))?
        .map(|secs| Duration::from_secs(secs as u64));

    let mut server = Server::new(chain, args.export_name.clone(), args.readonly);
    if let Some(tls_config) = tls_config.clone() {
        server = server.with_tls(tls_config);
    }
    if let Some(timeout) = timeout {
        server = server.with_timeout(timeout);
    }
    let server = Arc::new(server);

    let listener = Listener::bind(&endpoint).wrap_err("binding listener")?;
    if let Some(uri) = endpoint.uri(&args.export_name, tls_config.is_some()) {
        info!("listening on {uri}");
    } else {
        info!("listening on {endpoint:?}");
    }

    accept_loop(listener, move |stream, peer| {
        server.handle_connection(stream, peer)
    });
    Ok(())
}
