//! cqrpc command-line server and client.
//!
//! `cqrpc serve` runs the demo methods behind a TCP endpoint until Ctrl-C,
//! then shuts down gracefully. `cqrpc call` issues one call against a server.

mod services;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cqrpc::{Dispatcher, RequestEnvelope, ServerConfig, StreamItem, TcpClient, TcpEndpoint};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cqrpc")]
#[command(about = "Completion-queue RPC server and client")]
struct Cli {
	#[command(subcommand)]
	command: Command,

	/// Verbose logging
	#[arg(short, long, global = true)]
	verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Serve the demo methods until interrupted.
	Serve {
		/// TOML configuration file
		#[arg(short, long, value_name = "PATH")]
		config: Option<PathBuf>,

		/// Listen address, overriding the config file
		#[arg(short, long, value_name = "ADDR")]
		listen: Option<SocketAddr>,

		/// Worker threads, overriding the config file
		#[arg(short, long, value_name = "N")]
		workers: Option<usize>,
	},
	/// Issue one call and print the responses.
	Call {
		#[arg(short, long, value_name = "ADDR", default_value = "127.0.0.1:50055")]
		addr: SocketAddr,

		#[arg(short, long, value_name = "NAME")]
		method: String,

		/// Open a stream and send every payload on it
		#[arg(long)]
		stream: bool,

		/// Call deadline in milliseconds
		#[arg(long, value_name = "MS", default_value_t = 5000)]
		timeout_ms: u64,

		#[arg(required = true)]
		payloads: Vec<String>,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let subscriber = tracing_subscriber::fmt()
		.with_max_level(if cli.verbose {
			tracing::Level::DEBUG
		} else {
			tracing::Level::INFO
		})
		.finish();
	tracing::subscriber::set_global_default(subscriber)?;

	match cli.command {
		Command::Serve { config, listen, workers } => serve(config, listen, workers).await,
		Command::Call {
			addr,
			method,
			stream,
			timeout_ms,
			payloads,
		} => call(addr, &method, stream, Duration::from_millis(timeout_ms), payloads).await,
	}
}

async fn serve(path: Option<PathBuf>, listen: Option<SocketAddr>, workers: Option<usize>) -> anyhow::Result<()> {
	let mut config = match &path {
		Some(path) => ServerConfig::load(path)?,
		None => ServerConfig::default(),
	};
	if let Some(listen) = listen {
		config.listen = listen;
	}
	if let Some(workers) = workers {
		config.workers = workers;
	}
	config.validate()?;

	let endpoint = Arc::new(TcpEndpoint::from_config(&config)?);
	let addr = endpoint.local_addr();
	let dispatcher = services::register(Dispatcher::builder(config)).start(endpoint)?;
	let methods: Vec<_> = dispatcher.methods().into_iter().map(|method| method.name).collect();
	info!(%addr, ?methods, "server.listening");

	tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
	info!(in_flight = dispatcher.in_flight_calls(), "server.interrupted");

	let report = tokio::task::spawn_blocking(move || dispatcher.shutdown_graceful()).await?;
	info!(
		drained = report.drained,
		abandoned = report.abandoned,
		served = report.stats.served(),
		cancelled = report.stats.cancelled,
		failed_workers = report.failed_workers.len(),
		"server.stopped"
	);
	Ok(())
}

async fn call(addr: SocketAddr, method: &str, stream: bool, timeout: Duration, payloads: Vec<String>) -> anyhow::Result<()> {
	let client = TcpClient::new(addr).with_timeout(timeout);
	let requests = payloads.into_iter().enumerate().map(|(id, payload)| RequestEnvelope::new(id as u64, payload));

	if !stream {
		for request in requests {
			let id = request.id;
			let response = client.unary(method, request).await.with_context(|| format!("call {method} #{id}"))?;
			print_response(response.id, response.payload_str(), &response.status.to_string());
		}
		return Ok(());
	}

	let mut call = client.open_stream(method).await.with_context(|| format!("open stream {method}"))?;
	for request in requests {
		call.send(request).await?;
	}
	call.close_send().await?;
	loop {
		match call.recv().await? {
			StreamItem::Response(response) => print_response(response.id, response.payload_str(), &response.status.to_string()),
			StreamItem::End(status) => {
				println!("end: {status}");
				anyhow::ensure!(status.is_ok(), "stream ended with {status}");
				return Ok(());
			}
		}
	}
}

fn print_response(id: u64, payload: Option<&str>, status: &str) {
	match payload {
		Some(text) => println!("#{id} {status}: {text}"),
		None => println!("#{id} {status}: <binary>"),
	}
}
