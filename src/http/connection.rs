use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::http::parser::{ParseError, parse_http_request};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::writer::ResponseWriter;
use crate::proxy::{ForwardingEngine, Outcome};
use crate::static_files::StaticFiles;

const MAX_REQUEST_SIZE: usize = 1024 * 1024;

pub struct Connection {
    stream: TcpStream,
    buffer: Vec<u8>,
    state: ConnectionState,
    engine: Arc<ForwardingEngine>,
    statics: Arc<StaticFiles>,
}

pub enum ConnectionState {
    Reading,
    Dispatching(Request),
    Writing(ResponseWriter, bool), // bool = keep_alive?
    Closed,
}

impl Connection {
    pub fn new(stream: TcpStream, engine: Arc<ForwardingEngine>, statics: Arc<StaticFiles>) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(4096),
            state: ConnectionState::Reading,
            engine,
            statics,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match &mut self.state {
                ConnectionState::Reading => {
                    match self.read_request().await? {
                        Some(req) => {
                            self.state = ConnectionState::Dispatching(req);
                        }
                        None => {
                            self.state = ConnectionState::Closed;
                        }
                    }
                }

                ConnectionState::Dispatching(req) => {
                    match self.engine.handle(req, &mut self.stream).await {
                        // Proxied exchanges are close-delimited; the
                        // connection is done either way.
                        Outcome::Relayed(_) | Outcome::Failed(_) => {
                            self.state = ConnectionState::Closed;
                        }

                        Outcome::Delegated => {
                            let response = self.statics.serve(req).await;
                            let keep_alive = req.keep_alive();
                            let writer = ResponseWriter::new(&response);
                            self.state = ConnectionState::Writing(writer, keep_alive);
                        }
                    }
                }

                ConnectionState::Writing(writer, keep_alive) => {
                    writer.write_to_stream(&mut self.stream).await?;

                    if *keep_alive {
                        self.state = ConnectionState::Reading; // go back for next request
                    } else {
                        self.state = ConnectionState::Closed;
                    }
                }

                ConnectionState::Closed => {
                    break;
                }
            }
        }

        Ok(())
    }

    pub async fn read_request(&mut self) -> anyhow::Result<Option<Request>> {
        loop {
            // Try parsing whatever we already have
            match parse_http_request(&self.buffer) {
                Ok((request, consumed)) => {
                    self.buffer.drain(..consumed);
                    return Ok(Some(request));
                }

                Err(ParseError::Incomplete) => {
                    // Need more data → fall through to read
                }

                Err(e) => {
                    // Malformed request → answer 400 and drop the connection
                    let mut writer = ResponseWriter::new(&Response::bad_request());
                    let _ = writer.write_to_stream(&mut self.stream).await;
                    return Err(anyhow::anyhow!("HTTP parse error: {:?}", e));
                }
            }

            if self.buffer.len() > MAX_REQUEST_SIZE {
                anyhow::bail!("request exceeds {} bytes", MAX_REQUEST_SIZE);
            }

            // Read more data
            let mut temp = [0u8; 1024];
            let n = self.stream.read(&mut temp).await?;

            if n == 0 {
                // Client closed connection
                return Ok(None);
            }

            self.buffer.extend_from_slice(&temp[..n]);
        }
    }
}
