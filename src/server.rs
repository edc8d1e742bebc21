//! TCP line-protocol server for a store.
//!
//! Commands and responses are newline-terminated ASCII. Connections are
//! served one at a time on the accept thread, which serializes all store
//! access as the engine requires.

use crate::error::{Error, Result};
use crate::storage::BitStore;

use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

/// Greeting sent to every new connection.
const GREETING: &str = "Welcome to KVStore Server";

/// A line-protocol server for a single store.
pub struct Server {
    store: BitStore,
}

/// What the session loop should do after a command has been answered.
enum Flow {
    Continue,
    CloseConnection,
    Shutdown,
}

impl Server {
    pub fn new(store: BitStore) -> Self {
        Self { store }
    }

    /// Serves connections sequentially until a client issues SHUTDOWN,
    /// then closes the store. An error on one connection is logged and
    /// does not stop the server.
    pub fn serve(mut self, listener: TcpListener) -> Result<()> {
        log::info!("Listening on {}", listener.local_addr()?);
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    log::error!("Failed to accept connection: {err}");
                    continue;
                }
            };
            match self.session(stream) {
                Ok(Flow::Shutdown) => {
                    log::info!("Shutting down");
                    break;
                }
                Ok(_) => {}
                Err(err) => log::error!("Client error: {err}"),
            }
        }
        self.store.close()
    }

    /// Runs a single client session: greets, then answers one command per
    /// line until the client disconnects, EXITs, or SHUTDOWNs.
    fn session(&mut self, stream: TcpStream) -> Result<Flow> {
        let peer = stream.peer_addr()?;
        log::debug!("Client {peer} connected");
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;
        writeln!(writer, "{GREETING}")?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                log::debug!("Client {peer} disconnected");
                return Ok(Flow::CloseConnection);
            }
            let (response, flow) = self.execute(line.trim_end_matches(['\r', '\n']));
            writeln!(writer, "{response}")?;
            match flow {
                Flow::Continue => {}
                flow => return Ok(flow),
            }
        }
    }

    /// Executes one command line against the store and formats the
    /// protocol response. `NotFound` maps to `NOT_FOUND`; all other errors
    /// map to `ERR <reason>`.
    fn execute(&mut self, line: &str) -> (String, Flow) {
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let result = match command {
            "PUT" => self.put(rest),
            "GET" => self.get(rest),
            "DEL" => self.del(rest),
            "TTL" => self.ttl(rest),
            "STATS" => self.stats(),
            "COMPACT" => self.store.compact().map(|()| "OK".to_string()),
            "SHUTDOWN" => return ("OK".to_string(), Flow::Shutdown),
            "EXIT" => return ("OK".to_string(), Flow::CloseConnection),
            "" => Err(Error::InvalidInput("empty command".to_string())),
            _ => Err(Error::InvalidInput(format!("unknown command {command}"))),
        };
        let response = match result {
            Ok(response) => response,
            Err(Error::NotFound) => "NOT_FOUND".to_string(),
            Err(err) => format!("ERR {err}"),
        };
        (response, Flow::Continue)
    }

    fn put(&mut self, rest: &str) -> Result<String> {
        let (key, rest) =
            rest.split_once(' ').ok_or_else(|| usage("PUT <key> <value> [TTL <seconds>]"))?;
        if key.is_empty() || rest.is_empty() {
            return Err(usage("PUT <key> <value> [TTL <seconds>]"));
        }
        let (value, ttl) = parse_value_ttl(rest)?;
        self.store.put(key, Value::String(value.to_string()), ttl)?;
        Ok("OK".to_string())
    }

    fn get(&mut self, rest: &str) -> Result<String> {
        let key = single_arg(rest, "GET <key>")?;
        match self.store.get(key)? {
            Some(value) => Ok(format!("VALUE {}", format_value(&value))),
            None => Err(Error::NotFound),
        }
    }

    fn del(&mut self, rest: &str) -> Result<String> {
        let key = single_arg(rest, "DEL <key>")?;
        if self.store.delete(key)? {
            Ok("DELETED".to_string())
        } else {
            Err(Error::NotFound)
        }
    }

    fn ttl(&mut self, rest: &str) -> Result<String> {
        let (key, secs) = rest.split_once(' ').ok_or_else(|| usage("TTL <key> <seconds>"))?;
        let secs: i64 = secs.trim().parse().map_err(|_| usage("TTL <key> <seconds>"))?;
        if secs < 0 {
            return Err(Error::InvalidInput(format!("TTL must be non-negative, got {secs}")));
        }
        self.store.ttl(key, secs as u64)?;
        Ok("OK".to_string())
    }

    fn stats(&mut self) -> Result<String> {
        let stats = self.store.stats()?;
        let last = stats.last_compaction_time.map_or("null".to_string(), |t| t.to_string());
        Ok(format!(
            "keys_in_index: {}\nkeys_in_cache: {}\nput_count: {}\ndelete_count: {}\nfile_size_bytes: {}\nlast_compaction_time: {last}",
            stats.keys_in_index,
            stats.keys_in_cache,
            stats.put_count,
            stats.delete_count,
            stats.file_size_bytes,
        ))
    }
}

/// Splits an optional trailing ` TTL <seconds>` clause off a PUT value.
/// The clause only counts if the final token parses as an integer and a
/// value remains in front of it; anything else is part of the value.
/// Negative TTLs are rejected.
fn parse_value_ttl(rest: &str) -> Result<(&str, Option<u64>)> {
    let Some((value, secs)) = rest.rsplit_once(" TTL ") else {
        return Ok((rest, None));
    };
    let Ok(secs) = secs.trim().parse::<i64>() else {
        return Ok((rest, None));
    };
    if value.is_empty() {
        return Ok((rest, None));
    }
    if secs < 0 {
        return Err(Error::InvalidInput(format!("TTL must be non-negative, got {secs}")));
    }
    Ok((value, Some(secs as u64)))
}

/// Formats a value for the wire: strings are echoed raw, everything else
/// as compact JSON.
fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn single_arg<'a>(rest: &'a str, usage_msg: &str) -> Result<&'a str> {
    if rest.is_empty() || rest.contains(' ') {
        return Err(usage(usage_msg));
    }
    Ok(rest)
}

fn usage(usage_msg: &str) -> Error {
    Error::InvalidInput(format!("usage: {usage_msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use test_case::test_case;

    #[test_case("v", "v", None; "no ttl")]
    #[test_case("v TTL 5", "v", Some(5); "ttl")]
    #[test_case("hello world TTL 10", "hello world", Some(10); "value with spaces")]
    #[test_case("v TTL x", "v TTL x", None; "non numeric tail")]
    #[test_case("v TTL 1 TTL 2", "v TTL 1", Some(2); "last clause wins")]
    #[test_case("TTL 5", "TTL 5", None; "clause without value")]
    fn value_ttl(rest: &str, value: &str, ttl: Option<u64>) {
        assert_eq!(parse_value_ttl(rest).expect("parse failed"), (value, ttl));
    }

    #[test]
    fn negative_ttl_rejected() {
        assert!(parse_value_ttl("v TTL -1").is_err());
    }

    fn serve_temp() -> (SocketAddr, std::thread::JoinHandle<Result<()>>, tempfile::TempDir) {
        let dir = tempfile::TempDir::with_prefix("bitstore").expect("tempdir failed");
        let store = BitStore::open(dir.path().join("store")).expect("open failed");
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");
        let handle = std::thread::spawn(move || Server::new(store).serve(listener));
        (addr, handle, dir)
    }

    struct Client {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).expect("connect failed");
            let reader = BufReader::new(stream.try_clone().expect("clone failed"));
            let mut client = Self { reader, writer: stream };
            assert_eq!(client.read(), GREETING);
            client
        }

        fn send(&mut self, line: &str) -> String {
            writeln!(self.writer, "{line}").expect("write failed");
            self.read()
        }

        fn read(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).expect("read failed");
            line.trim_end().to_string()
        }
    }

    /// A full session covering every command, a reconnect, and SHUTDOWN.
    #[test]
    fn session() {
        let (addr, handle, _dir) = serve_temp();
        let mut client = Client::connect(addr);

        assert_eq!(client.send("PUT a 1"), "OK");
        assert_eq!(client.send("GET a"), "VALUE 1");
        assert_eq!(client.send("DEL a"), "DELETED");
        assert_eq!(client.send("GET a"), "NOT_FOUND");
        assert_eq!(client.send("DEL a"), "NOT_FOUND");

        assert_eq!(client.send("PUT s hello world TTL 100"), "OK");
        assert_eq!(client.send("GET s"), "VALUE hello world");
        assert_eq!(client.send("TTL s 200"), "OK");
        assert_eq!(client.send("TTL missing 5"), "NOT_FOUND");
        assert_eq!(client.send("COMPACT"), "OK");

        assert!(client.send("PUT a v TTL -1").starts_with("ERR "));
        assert!(client.send("TTL s -1").starts_with("ERR "));
        assert!(client.send("PUT a").starts_with("ERR "));
        assert!(client.send("GET a b").starts_with("ERR "));
        assert!(client.send("BOGUS x").starts_with("ERR "));

        assert_eq!(client.send("STATS"), "keys_in_index: 1");
        for expect in [
            "keys_in_cache: ",
            "put_count: ",
            "delete_count: ",
            "file_size_bytes: ",
            "last_compaction_time: ",
        ] {
            let line = client.read();
            assert!(line.starts_with(expect), "got {line}");
        }

        assert_eq!(client.send("EXIT"), "OK");

        // The store survives across connections.
        let mut client = Client::connect(addr);
        assert_eq!(client.send("GET s"), "VALUE hello world");
        assert_eq!(client.send("SHUTDOWN"), "OK");
        handle.join().expect("server thread panicked").expect("serve failed");
    }
}
