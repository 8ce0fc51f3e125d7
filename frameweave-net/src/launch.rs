// Copyright (c) the frameweave authors
//
// This source code is licensed under the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Spawning render processes on remote hosts.
//!
//! A [crate::connection::ConnectionDescription] with a non-empty launch
//! command enables auto-launch: the template is expanded, tokenised
//! respecting the description's quote character, and executed. The
//! expanded client argument string tells the child how to dial back:
//! `listenerAddress#requestID`, where the request id resolves the
//! parent's pending connect once the child's handshake arrives.
//!
//! Template substitutions:
//!
//! * `%h` - the remote hostname
//! * `%n` - the program name
//! * `%w` - the working directory
//! * `%c` - the client argument string, wrapped in the quote character
//! * `%q` - the literal quote character

use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::connection::ConnectionDescription;
use crate::error::NetError;
use crate::{NetResult, RequestId};

/// Everything needed to expand a launch command template
#[derive(Debug, Clone)]
pub struct LaunchParams {
    /// Program name of the render process (`%n`)
    pub program: String,
    /// Working directory for the render process (`%w`)
    pub workdir: String,
    /// Client argument string (`%c`), see [format_client_args]
    pub client_args: String,
}

/// Build the client argument string handed to a launched process
pub fn format_client_args(listener_address: &str, request: RequestId) -> String {
    format!("{listener_address}#{request}")
}

/// Parse a client argument string back into the parent's listener
/// address and the pending connect request id
pub fn parse_client_args(args: &str) -> NetResult<(String, RequestId)> {
    let (address, request) = args
        .rsplit_once('#')
        .ok_or_else(|| NetError::MalformedPacket(format!("malformed client args '{args}'")))?;
    let id = request
        .parse::<u32>()
        .map_err(|_| NetError::MalformedPacket(format!("malformed request id in '{args}'")))?;
    Ok((address.to_string(), RequestId(id)))
}

/// Expand the launch command template of a description
pub fn expand_command(description: &ConnectionDescription, params: &LaunchParams) -> String {
    let quote = description.launch_quote_char;
    let mut out = String::with_capacity(description.launch_command.len() + 64);
    let mut chars = description.launch_command.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('h') => out.push_str(&description.hostname),
            Some('n') => out.push_str(&params.program),
            Some('w') => out.push_str(&params.workdir),
            Some('c') => {
                out.push(quote);
                out.push_str(&params.client_args);
                out.push(quote);
            }
            Some('q') => out.push(quote),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Split an expanded command into arguments, honouring the quote
/// character. Quotes group words; they are not part of the argument.
pub fn tokenize(command: &str, quote: char) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in command.chars() {
        if c == quote {
            quoted = !quoted;
        } else if c.is_whitespace() && !quoted {
            if !current.is_empty() {
                args.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

/// Expand and spawn the launch command of a description. The child is
/// detached; the caller observes it only through the connect-back on the
/// embedded request id.
pub fn launch(description: &ConnectionDescription, params: &LaunchParams) -> NetResult<Child> {
    let command = expand_command(description, params);
    let argv = tokenize(&command, description.launch_quote_char);
    if argv.is_empty() {
        return Err(NetError::HandshakeFailed(format!(
            "empty launch command for {description}"
        )));
    }
    tracing::info!("Launching render process: {command}");

    let child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .spawn()?;
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionKind;
    use std::time::Duration;

    fn description(command: &str) -> ConnectionDescription {
        ConnectionDescription {
            kind: ConnectionKind::Tcpip,
            hostname: "render1".into(),
            port: 4242,
            bandwidth: 0,
            launch_command: command.into(),
            launch_timeout: Duration::from_secs(10),
            launch_quote_char: '\'',
        }
    }

    #[test]
    fn expansion_substitutes_all_variables() {
        let description = description("ssh -n %h %n -d %w -- --eq-client %c");
        let params = LaunchParams {
            program: "/opt/render/bin/weave".into(),
            workdir: "/opt/render".into(),
            client_args: "10.0.0.1:4242#3".into(),
        };
        let expanded = expand_command(&description, &params);
        assert_eq!(
            expanded,
            "ssh -n render1 /opt/render/bin/weave -d /opt/render -- --eq-client '10.0.0.1:4242#3'"
        );
    }

    #[test]
    fn tokenize_respects_quotes() {
        let args = tokenize("ssh render1 'a b c' d", '\'');
        assert_eq!(args, vec!["ssh", "render1", "a b c", "d"]);
    }

    #[test]
    fn client_args_roundtrip() {
        let args = format_client_args("host:1234", RequestId(9));
        let (address, request) = parse_client_args(&args).unwrap();
        assert_eq!(address, "host:1234");
        assert_eq!(request, RequestId(9));
    }

    #[test]
    fn malformed_client_args_are_rejected() {
        assert!(parse_client_args("no-separator").is_err());
        assert!(parse_client_args("host#notanumber").is_err());
    }
}
