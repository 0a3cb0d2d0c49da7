//! Client subcommands: `send`, `listen`, `config`.

use std::time::Duration;

use anyhow::{Context, Result};
use playconf::{ConfigSources, PlaydConfig};
use playproto::{parse_tag_reply, send_line, Command, Endpoints, Listener, Reply};
use tracing::{debug, info, warn};

/// Send one line and print the reply. Returns whether the reply was `OK`.
pub async fn send(endpoint: &str, line: &str, timeout: Duration, pretty: bool) -> Result<bool> {
    // catch obvious typos locally; the daemon would only say "Message is Invalid"
    if let Err(e) = Command::parse(line) {
        warn!("{:?} is not a valid request ({}); sending anyway", line, e);
    }

    let text = send_line(endpoint, line, timeout).await?;
    println!("{}", render_reply(line, &text, pretty));

    Ok(Reply::parse(&text).is_some_and(|reply| reply.is_ok()))
}

/// Reply text as printed by `send`. With `pretty`, `TAGS` bodies are
/// grouped as `name: value, value`.
pub fn render_reply(line: &str, text: &str, pretty: bool) -> String {
    let is_tags = Command::parse(line).is_ok_and(|c| c.verb == "TAGS");
    if !pretty || !is_tags {
        return text.to_string();
    }

    match Reply::parse(text) {
        Some(Reply::Lines(lines)) => {
            let mut out = String::from("OK");
            for (name, values) in parse_tag_reply(&lines.join("\n")) {
                out.push('\n');
                out.push_str(&format!("{}: {}", name, values.join(", ")));
            }
            out
        }
        _ => text.to_string(),
    }
}

/// Print every line published by the daemon until interrupted.
pub async fn listen(endpoints: &Endpoints, address: Option<&str>, timeout: Duration) -> Result<()> {
    let address = match address {
        Some(address) => address.to_string(),
        None => publish_address(endpoints, timeout).await,
    };

    let mut listener = Listener::connect(&address)
        .with_context(|| format!("Failed to subscribe to {}", address))?;
    info!("listening on {}", listener.endpoint());

    loop {
        tokio::select! {
            line = listener.recv() => println!("{}", line?),
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Ask the daemon for its publish address, falling back to the derived one.
pub async fn publish_address(endpoints: &Endpoints, timeout: Duration) -> String {
    match send_line(&endpoints.reply, "PUBSUB", timeout).await {
        Ok(text) => match Reply::parse(&text) {
            Some(Reply::Ok(Some(address))) => return address,
            _ => debug!("unexpected PUBSUB reply: {}", text),
        },
        Err(e) => debug!("PUBSUB failed: {:#}", e),
    }
    let fallback = playproto::connectable(&endpoints.publish);
    warn!("daemon did not report a publish address, using {}", fallback);
    fallback
}

/// Print the effective configuration and where it came from.
pub fn print_config(config: &PlaydConfig, sources: &ConfigSources) {
    for file in &sources.files {
        println!("# from {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env {}", var);
    }
    print!("{}", config.to_toml());
}
