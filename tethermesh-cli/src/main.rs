// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

mod agent;
mod certgen;

fn validate_byte_count(raw: &str) -> Result<(), String> {
  match raw.parse::<usize>() {
    Ok(0) => Err(String::from("Token length must be at least one byte")),
    Ok(_) => Ok(()),
    Err(e) => Err(e.to_string()),
  }
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("yamux=warn,debug"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("run")
        .about("Run a mesh node: serve its listeners and connect its tethers")
        .arg(
          Arg::new("config")
            .help("Node configuration; a template is written if it does not exist")
            .long("config")
            .short('c')
            .takes_value(true)
            .default_value("./config.json"),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate a self-signed certificate for a relay listener")
        .arg(
          Arg::new("path")
            .help("Output base path; `.crt` and `.key` are appended")
            .takes_value(true)
            .default_value("server"),
        )
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand(
      Command::new("token")
        .about("Print a random URL-safe credential for use as a tether password")
        .arg(
          Arg::new("length")
            .help("Number of random bytes before encoding")
            .long("length")
            .short('l')
            .validator(validate_byte_count)
            .takes_value(true)
            .default_value("24"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("run", opts) => {
      let config_path = PathBuf::from(opts.value_of("config").expect("Config has a default"));
      agent::agent_main(agent::AgentArgs { config_path }).await
    }
    ("cert", opts) => {
      tracing::info!("Generating certs...");
      let path_raw = opts.value_of("path").expect("Path has a default");
      let san = opts.value_of("san").expect("SAN argument must exist");
      certgen::certgen_main(path_raw.into(), san.into()).await
    }
    ("token", opts) => {
      let length: usize = opts
        .value_of("length")
        .expect("Length has a default")
        .parse()
        .context("Token length must be a byte count")?;
      println!("{}", tethermesh::util::token::generate_token(length));
      Ok(())
    }
    (_, _) => unreachable!(),
  }
}
