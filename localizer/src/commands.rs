//! The `list` and `expose` subcommands, which talk to a running daemon.

use anyhow::{bail, Result};
use localizer_api::{Client, ConsoleLevel, Request, ServiceStatus, SOCKET_PATH};

pub async fn list() -> Result<()> {
    let client = daemon_client()?;
    let mut services = client.list().await?;
    services.sort_by(|a, b| {
        (a.name.as_str(), a.namespace.as_str()).cmp(&(b.name.as_str(), b.namespace.as_str()))
    });

    let rows: Vec<[String; 7]> = services.iter().map(row).collect();
    print_table(
        [
            "NAMESPACE",
            "NAME",
            "STATUS",
            "REASON",
            "ENDPOINT",
            "IP-ADDRESS",
            "PORT(S)",
        ],
        &rows,
    );
    Ok(())
}

pub async fn expose(target: &str, map: &[String], stop: bool) -> Result<()> {
    let Some((namespace, service)) = target.split_once('/') else {
        bail!("invalid service, expected namespace/name");
    };
    let client = daemon_client()?;

    let request = if stop {
        tracing::info!("sending stop expose request to daemon");
        Request::StopExpose {
            namespace: namespace.to_string(),
            service: service.to_string(),
        }
    } else {
        tracing::info!("sending expose request to daemon");
        Request::ExposeService {
            namespace: namespace.to_string(),
            service: service.to_string(),
            port_map: map.to_vec(),
        }
    };

    client
        .stream(request, |level, message| match level {
            ConsoleLevel::Info => tracing::info!("{message}"),
            ConsoleLevel::Warn => tracing::warn!("{message}"),
            ConsoleLevel::Error => tracing::error!("{message}"),
        })
        .await
}

fn daemon_client() -> Result<Client> {
    let client = Client::new(SOCKET_PATH);
    if !client.socket_exists() {
        bail!("localizer daemon not running (run localizer by itself?)");
    }
    Ok(client)
}

fn row(service: &ServiceStatus) -> [String; 7] {
    let ports: Vec<String> = service.ports.iter().map(|p| format_port(p)).collect();
    [
        service.namespace.clone(),
        service.name.clone(),
        capitalize(&service.status),
        service.status_reason.clone(),
        service.endpoint.clone(),
        service.ip.clone(),
        ports.join(","),
    ]
}

/// `80:80` renders as `80/tcp`, `80:8080` as `80->8080/tcp`.
fn format_port(raw: &str) -> String {
    match raw.split_once(':') {
        Some((local, remote)) if local == remote => format!("{local}/tcp"),
        Some((local, remote)) => format!("{local}->{remote}/tcp"),
        None => format!("{raw}/tcp"),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

fn print_table<const N: usize>(header: [&str; N], rows: &[[String; N]]) {
    let mut widths: [usize; N] = [0; N];
    for (i, head) in header.iter().enumerate() {
        widths[i] = head.len();
    }
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut line = String::new();
    for (i, head) in header.iter().enumerate() {
        line.push_str(&format!("{head:<width$}   ", width = widths[i]));
    }
    println!("{}", line.trim_end());

    for row in rows {
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate() {
            line.push_str(&format!("{cell:<width$}   ", width = widths[i]));
        }
        println!("{}", line.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_render_in_the_short_form_when_unmapped() {
        assert_eq!(format_port("80:80"), "80/tcp");
        assert_eq!(format_port("80:8080"), "80->8080/tcp");
        assert_eq!(format_port("9000"), "9000/tcp");
    }

    #[test]
    fn statuses_are_capitalized_for_display() {
        assert_eq!(capitalize("running"), "Running");
        assert_eq!(capitalize(""), "");
    }
}
