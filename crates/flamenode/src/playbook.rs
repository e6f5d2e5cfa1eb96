//! The startup contract of a node process: `--entropy-identity <name>` and
//! `--entropy-playbook <host,port,db>` point it at the directory server.

use flamecore::{DirectoryError, FlameError};
use std::str::FromStr;

/// Directory-server coordinates as passed in `--entropy-playbook`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybookAddress {
    pub host: String,
    pub port: u16,
    pub db: String,
}

impl FromStr for PlaybookAddress {
    type Err = FlameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 3 {
            return Err(DirectoryError::Protocol(format!(
                "playbook address must be host,port,db: '{s}'"
            ))
            .into());
        }
        let port = parts[1].parse().map_err(|_| {
            FlameError::Directory(DirectoryError::Protocol(format!(
                "invalid playbook port: '{s}'"
            )))
        })?;
        Ok(Self {
            host: parts[0].to_string(),
            port,
            db: parts[2].to_string(),
        })
    }
}

/// Parse the node identity and playbook address from the process arguments.
pub fn parse_node_args<I>(args: I) -> Result<(String, PlaybookAddress), FlameError>
where
    I: IntoIterator<Item = String>,
{
    let mut identity = None;
    let mut playbook = None;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--entropy-identity" => identity = iter.next(),
            "--entropy-playbook" => playbook = iter.next(),
            _ => {}
        }
    }
    let identity = identity.ok_or_else(|| {
        FlameError::Directory(DirectoryError::Protocol(
            "missing --entropy-identity".to_string(),
        ))
    })?;
    let playbook = playbook
        .ok_or_else(|| {
            FlameError::Directory(DirectoryError::Protocol(
                "missing --entropy-playbook".to_string(),
            ))
        })?
        .parse()?;
    Ok((identity, playbook))
}
