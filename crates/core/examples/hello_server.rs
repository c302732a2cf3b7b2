//! A tiny HTTP responder built from the parser and the transport.
//!
//! Answers every request head with `Hello World!`. Request bodies are not
//! supported. Pass a JSON config file as the first argument to override the
//! defaults.

use std::error::Error;
use std::fs::File;
use std::io;

use bytes::{Bytes, BytesMut};
use micro_core::codec::RequestParser;
use micro_core::config::{ConnectionConfig, CoreConfig, ListenConfig};
use micro_core::connection::{Connection, Listener, WriteRequest};
use micro_core::handler::{ConnectionHandler, ListenerHandler, ParserHandler};
use micro_core::protocol::{CallbackResult, HeaderField, RequestLine};
use micro_core::reactor::{Reactor, ReactorHandle};
use tracing::{Level, debug, info, warn};
use tracing_subscriber::FmtSubscriber;

const RESPONSE_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 12\r\n\r\n";
const RESPONSE_BODY: &[u8] = b"Hello World!";

fn main() -> Result<(), Box<dyn Error>> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = match std::env::args().nth(1) {
        Some(path) => CoreConfig::from_reader(File::open(path)?)?,
        None => CoreConfig::default().with_listen(ListenConfig::default().with_address("127.0.0.1").with_port(8080)),
    };

    let reactor = Reactor::new()?;
    let acceptor = Acceptor { reactor: reactor.handle(), config: config.clone() };
    let listener = Listener::from_config(&reactor.handle(), acceptor, config.listen())?;
    info!(addr = %listener.socket_name()?, "start listening");

    reactor.run()?;
    Ok(())
}

struct Acceptor {
    reactor: ReactorHandle,
    config: CoreConfig,
}

impl ListenerHandler for Acceptor {
    fn on_connection(&mut self, _listener: &Listener) -> CallbackResult<Connection> {
        let session = HttpSession { parser: self.config.parser().build(), config: self.config.connection().clone() };
        Ok(Connection::with_config(&self.reactor, session, self.config.connection())?)
    }
}

struct HttpSession {
    parser: RequestParser,
    config: ConnectionConfig,
}

#[derive(Default)]
struct Requests {
    completed: usize,
}

impl ParserHandler for Requests {
    fn on_request_line(&mut self, line: &RequestLine<'_>) -> CallbackResult {
        info!(method = %String::from_utf8_lossy(line.method()), path = %String::from_utf8_lossy(line.path()), "request");
        Ok(())
    }

    fn on_header(&mut self, field: &HeaderField<'_>) -> CallbackResult {
        debug!(name = %String::from_utf8_lossy(field.name()), "header");
        Ok(())
    }

    fn on_message_complete(&mut self) -> CallbackResult {
        self.completed += 1;
        Ok(())
    }
}

impl ConnectionHandler for HttpSession {
    fn on_connect(&mut self, conn: &Connection, status: io::Result<()>) -> CallbackResult {
        match status {
            Ok(()) => conn.read_start(self.config.read_buffer())?,
            Err(e) => {
                warn!(cause = %e, "failed to accept");
                conn.close()?;
            }
        }
        Ok(())
    }

    fn on_read(&mut self, conn: &Connection, buf: BytesMut, nread: io::Result<usize>) -> CallbackResult<BytesMut> {
        let n = match nread {
            Ok(0) => {
                conn.close()?;
                return Ok(BytesMut::new());
            }
            Ok(n) => n,
            Err(e) => {
                warn!(cause = %e, "read failed");
                conn.close()?;
                return Ok(BytesMut::new());
            }
        };

        let mut requests = Requests::default();
        if let Err(e) = self.parser.execute(&buf[..n], &mut requests) {
            warn!(cause = %e, "bad request");
            conn.close()?;
            return Ok(BytesMut::new());
        }

        for _ in 0..requests.completed {
            conn.write_two(Bytes::from_static(RESPONSE_HEAD), Bytes::from_static(RESPONSE_BODY))?;
        }
        Ok(buf)
    }

    fn on_write(&mut self, conn: &Connection, _req: WriteRequest, status: io::Result<()>) -> CallbackResult {
        if let Err(e) = status {
            warn!(cause = %e, "write failed");
            conn.close()?;
        }
        Ok(())
    }

    fn on_close(&mut self, _conn: &Connection) -> CallbackResult {
        debug!("connection closed");
        Ok(())
    }
}
