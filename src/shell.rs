//! Built-in diagnostic shell.
//!
//! A small stand-in for a real command interpreter: it echoes input and
//! knows a handful of commands, enough to drive the engine from telnet,
//! netcat or a browser.

use crate::handler::{Flow, Handler, HandlerFactory};
use crate::protocols::line::{EOT, IAC, IP};
use crate::protocols::websocket::handshake::UpgradeRequest;
use crate::runtime::{Mode, Sender};
use crate::server::ServerHandle;

/// Paths a websocket client may open a shell on.
const SHELL_PATHS: &[&str] = &["/", "/shell"];

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\nServer: CogServer\r\nContent-Length: 0\r\n\r\n";

const PLAIN_PAGE: &str = "This is a websocket shell. Connect with a websocket client.\n";

const HELP: &str = "\
Available commands:
  help      this text
  stats     list open connections
  quit      close this connection
  shutdown  stop the server and close every connection
Anything else is echoed back.
";

/// Creates one [`Shell`] per connection.
pub struct ShellFactory {
    server: ServerHandle,
    prompt: String,
}

impl ShellFactory {
    pub fn new(server: ServerHandle, prompt: impl Into<String>) -> Self {
        Self {
            server,
            prompt: prompt.into(),
        }
    }
}

impl HandlerFactory for ShellFactory {
    fn create(&self, mode: Mode) -> Box<dyn Handler> {
        Box::new(Shell {
            server: self.server.clone(),
            prompt: self.prompt.clone(),
            mode,
        })
    }
}

pub struct Shell {
    server: ServerHandle,
    prompt: String,
    mode: Mode,
}

impl Shell {
    fn prompt(&self, out: &Sender) {
        if self.mode == Mode::Line {
            out.send(self.prompt.as_bytes());
        }
    }
}

impl Handler for Shell {
    fn on_connected(&mut self, out: &Sender, request: Option<&UpgradeRequest>) -> Flow {
        let Some(request) = request else {
            self.prompt(out);
            return Flow::Continue;
        };

        if !SHELL_PATHS.contains(&request.path.as_str()) {
            out.send(NOT_FOUND);
            return Flow::quiet(format!("no shell at {}", request.path));
        }
        if !request.upgrade {
            let page = format!(
                "HTTP/1.1 200 OK\r\nServer: CogServer\r\nContent-Type: text/plain\r\n\
                 Content-Length: {}\r\n\r\n{PLAIN_PAGE}",
                PLAIN_PAGE.len()
            );
            out.send(page.as_bytes());
            return Flow::quiet("plain HTTP request");
        }
        Flow::Continue
    }

    fn on_message(&mut self, out: &Sender, message: &[u8]) -> Flow {
        if message.contains(&EOT) {
            return Flow::quiet("end of transmission");
        }
        if let Some(at) = message.iter().position(|&b| b == IAC) {
            // Telnet interrupt: drop what was typed and start over.
            if message.get(at + 1) == Some(&IP) {
                out.send(b"\n");
                self.prompt(out);
            }
            return Flow::Continue;
        }

        let text = String::from_utf8_lossy(message);
        match text.trim() {
            "" => {}
            "help" => out.reply(HELP.as_bytes()),
            "stats" => out.reply(self.server.registry().snapshot().as_bytes()),
            "quit" | "exit" => return Flow::quiet("quit"),
            "shutdown" => {
                out.reply(b"Shutting down\n");
                self.server.stop();
                return Flow::Abort {
                    reason: "shutdown requested".to_string(),
                    log: true,
                };
            }
            other => out.reply(format!("{other}\n").as_bytes()),
        }
        self.prompt(out);
        Flow::Continue
    }
}
