/*
** This file is a part of Iksemel (XML parser for Jabber/XMPP)
** Copyright (C) 2000-2025 Gurer Ozen
**
** Iksemel is free software: you can redistribute it and/or modify it
** under the terms of the GNU Lesser General Public License as
** published by the Free Software Foundation, either version 3 of
** the License, or (at your option) any later version.
*/

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use iksclient::Client;
use iksclient::ClientBuilder;
use iksclient::Jid;
use iksclient::TlsPolicy;

/// This tool can communicate over XMPP. Events are printed to stdout as
/// JSON lines.
#[derive(Parser)]
#[command(name = "iksjab", version = iksclient::VERSION)]
#[command(after_help = "Report issues at https://github.com/meduketto/iksemel-rust/issues")]
struct Cli {
    /// Jabber ID
    #[arg(short, long, env = "IKSJAB_JID")]
    jid: String,

    /// Password, prompted for when not given
    #[arg(long, env = "IKSJAB_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Server as host, host:port, or a ws:// or wss:// URL
    #[arg(short, long, conflicts_with = "websocket")]
    server: Option<String>,

    /// Connect through the WebSocket endpoint at this URL
    #[arg(short, long)]
    websocket: Option<String>,

    /// Resource to request
    #[arg(short, long)]
    resource: Option<String>,

    /// TLS policy: required, opportunistic or disabled
    #[arg(long, default_value = "required", value_parser = parse_tls)]
    tls: TlsPolicy,

    /// Never upgrade to TLS, same as --tls disabled
    #[arg(long, conflicts_with = "tls")]
    no_tls: bool,

    /// Allow PLAIN authentication over an unencrypted stream
    #[arg(long)]
    allow_plain: bool,

    /// Create the account instead of logging in
    #[arg(long)]
    register: bool,

    /// Display name to register with
    #[arg(long, requires = "register")]
    name: Option<String>,

    /// Delete the account after logging in
    #[arg(long, conflicts_with = "register")]
    delete_account: bool,

    /// Send a message to this address after logging in
    #[arg(long, requires = "body")]
    to: Option<String>,

    /// Message text for --to
    #[arg(long, requires = "to")]
    body: Option<String>,

    /// Log raw stream traffic
    #[arg(short, long)]
    debug: bool,
}

fn parse_tls(value: &str) -> Result<TlsPolicy, String> {
    match value {
        "required" => Ok(TlsPolicy::Required),
        "opportunistic" => Ok(TlsPolicy::Opportunistic),
        "disabled" => Ok(TlsPolicy::Disabled),
        _ => Err(format!("unknown TLS policy {value:?}")),
    }
}

fn build_client(cli: &Cli) -> Result<Client, String> {
    let server = cli.websocket.as_deref().or(cli.server.as_deref());
    let tls = if cli.no_tls { TlsPolicy::Disabled } else { cli.tls };
    let mut builder = ClientBuilder::new()
        .server(server)
        .map_err(|err| err.to_string())?
        .tls(tls)
        .allow_plain_without_tls(cli.allow_plain)
        .log_traffic(cli.debug);
    if let Some(resource) = &cli.resource {
        builder = builder.resource(resource.clone());
    }
    Ok(builder.build())
}

async fn run(cli: Cli) -> Result<(), String> {
    let client = build_client(&cli)?;
    let password = match &cli.password {
        Some(password) => password.clone(),
        None => rpassword::prompt_password("Password: ").map_err(|err| err.to_string())?,
    };

    client.on_any(|event| match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(err) => eprintln!("Error: {err}"),
    });

    if cli.register {
        client
            .register(&cli.jid, &password, cli.name.as_deref())
            .await
            .map_err(|err| err.to_string())?;
        println!("Account {} created", cli.jid);
        return Ok(());
    }

    let session = client
        .connect(&cli.jid, &password)
        .await
        .map_err(|err| err.to_string())?;

    if cli.delete_account {
        session
            .delete_account()
            .await
            .map_err(|err| err.to_string())?;
        println!("Account {} deleted", session.jid().to_bare());
        return Ok(());
    }

    if let (Some(to), Some(body)) = (&cli.to, &cli.body) {
        let to = Jid::new(to).map_err(|err| err.to_string())?;
        session
            .send_message(&to, body)
            .await
            .map_err(|err| err.to_string())?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => session.logout().await,
        _ = session.closed() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "iksclient=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
