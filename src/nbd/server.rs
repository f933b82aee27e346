//! NBD server implementation
//!
//! Serves one [`Chain`] to any number of clients. Each client gets its
//! own [`Connection`]; how many connections and requests run at once is
//! governed by the chain's negotiated thread model.

use super::protocol::*;
use crate::backend::ThreadModel;
use crate::chain::Chain;
use crate::connection::{Connection, Reply, Request};
use byteorder::{BigEndian, WriteBytesExt};
use parking_lot::Mutex;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

/// Largest read or write payload accepted in one request
pub const MAX_REQUEST_SIZE: u32 = 32 * 1024 * 1024;

/// NBD server configuration
#[derive(Debug, Clone)]
pub struct NbdServerConfig {
    pub bind_addr: String,
    pub export_name: String,
    pub readonly: bool,
}

impl Default for NbdServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:10809".to_string(),
            export_name: String::new(),
            readonly: false,
        }
    }
}

/// Enforces the request side of a thread model
#[derive(Debug)]
pub struct Scheduler {
    model: ThreadModel,
    requests: Mutex<()>,
}

impl Scheduler {
    pub fn new(model: ThreadModel) -> Self {
        Self {
            model,
            requests: Mutex::new(()),
        }
    }

    pub fn model(&self) -> ThreadModel {
        self.model
    }

    /// Run one request, holding the global request lock when the model
    /// allows only one request across all connections.
    pub fn request<T>(&self, call: impl FnOnce() -> T) -> T {
        if self.model <= ThreadModel::SerializeAllRequests {
            let _guard = self.requests.lock();
            call()
        } else {
            call()
        }
    }
}

/// NBD server
pub struct NbdServer {
    config: Arc<NbdServerConfig>,
    chain: Arc<Chain>,
    scheduler: Arc<Scheduler>,
}

impl NbdServer {
    pub fn new(config: NbdServerConfig, chain: Chain) -> Self {
        let scheduler = Scheduler::new(chain.thread_model());
        Self {
            config: Arc::new(config),
            chain: Arc::new(chain),
            scheduler: Arc::new(scheduler),
        }
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn run(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)?;
        log::info!("NBD server listening on {}", self.config.bind_addr);
        log::info!("Export name: {:?}", self.config.export_name);
        log::info!("Thread model: {}", self.scheduler.model());

        for stream in listener.incoming() {
            match stream {
                Ok(stream) if self.scheduler.model() == ThreadModel::SerializeConnections => {
                    // One connection at a time: serve it before accepting more
                    if let Err(e) = handle_client(stream, &self.chain, &self.config, &self.scheduler) {
                        log::warn!("Client handler error: {}", e);
                    }
                }
                Ok(stream) => {
                    let chain = Arc::clone(&self.chain);
                    let config = Arc::clone(&self.config);
                    let scheduler = Arc::clone(&self.scheduler);
                    thread::spawn(move || {
                        if let Err(e) = handle_client(stream, &chain, &config, &scheduler) {
                            log::warn!("Client handler error: {}", e);
                        }
                    });
                }
                Err(e) => log::error!("Connection error: {}", e),
            }
        }

        Ok(())
    }
}

/// Handle NBD client connection
fn handle_client(
    stream: TcpStream,
    chain: &Chain,
    config: &NbdServerConfig,
    scheduler: &Scheduler,
) -> io::Result<()> {
    let peer_addr = stream.peer_addr()?;
    log::info!("Client connected: {}", peer_addr);

    let reader = BufReader::new(stream.try_clone()?);
    let writer = BufWriter::new(stream);
    let result = serve(reader, writer, chain, config, scheduler);

    log::info!("Client disconnected: {}", peer_addr);
    result
}

/// Run the handshake and request loop for one client
pub fn serve<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    chain: &Chain,
    config: &NbdServerConfig,
    scheduler: &Scheduler,
) -> io::Result<()> {
    let conn = Connection::new(chain, config.readonly);

    send_newstyle_handshake(&mut reader, &mut writer, &config.export_name, |name| {
        if name != config.export_name {
            log::debug!("Client asked for export {:?}, serving the default", name);
        }
        conn.open().map_err(io::Error::other)?;
        let info = conn.negotiate().map_err(io::Error::other)?;
        Ok((info.size, transmission_flags(&info)))
    })?;

    if let Some(info) = conn.export() {
        log::info!(
            "Completed handshake: connection={} size={} bytes flags=0x{:04x}",
            conn.id(),
            info.size,
            transmission_flags(&info)
        );
    }

    loop {
        let request = match NbdRequest::read(&mut reader) {
            Ok(req) => req,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                log::error!("Failed to read request: {}", e);
                break;
            }
        };

        log::debug!(
            "Request: {:?}, flags=0x{:04x}, handle={:016x}, offset={}, length={}",
            request.command_type(),
            request.flags,
            request.handle,
            request.offset,
            request.length
        );

        if !handle_request(&conn, &request, &mut reader, &mut writer, scheduler)? {
            log::debug!("Client requested disconnect");
            break;
        }
    }

    conn.close();
    Ok(())
}

/// Answer one request. Returns false on disconnect.
fn handle_request<R: Read, W: Write>(
    conn: &Connection<'_>,
    request: &NbdRequest,
    reader: &mut R,
    writer: &mut W,
    scheduler: &Scheduler,
) -> io::Result<bool> {
    let offset = request.offset;
    let count = request.length;
    let flags = request.backend_flags();

    let call = match request.command_type() {
        Some(NbdCommand::Disc) => return Ok(false),
        Some(NbdCommand::Read) if count > MAX_REQUEST_SIZE => None,
        Some(NbdCommand::Read) => Some(Request::Read {
            offset,
            count,
            flags,
        }),
        Some(NbdCommand::Write) if count > MAX_REQUEST_SIZE => {
            // Read and discard data
            io::copy(&mut reader.by_ref().take(count as u64), &mut io::sink())?;
            None
        }
        Some(NbdCommand::Write) => {
            let mut data = vec![0u8; count as usize];
            reader.read_exact(&mut data)?;
            Some(Request::Write {
                offset,
                data,
                flags,
            })
        }
        Some(NbdCommand::Flush) => Some(Request::Flush { flags }),
        Some(NbdCommand::Trim) => Some(Request::Trim {
            offset,
            count,
            flags,
        }),
        Some(NbdCommand::WriteZeroes) => Some(Request::Zero {
            offset,
            count,
            flags,
        }),
        Some(NbdCommand::Cache) => Some(Request::Cache {
            offset,
            count,
            flags,
        }),
        None => {
            log::warn!("Unsupported command: {}", request.command);
            None
        }
    };

    let (error, data) = match call {
        None => (NBD_EINVAL, None),
        Some(call) => match scheduler.request(|| conn.invoke(call)) {
            Ok(Reply::Data(data)) => (0, Some(data)),
            Ok(_) => (0, None),
            Err(e) => {
                log::debug!("Request {:016x} failed: {}", request.handle, e);
                (nbd_error(e.errno()), None)
            }
        },
    };

    NbdReply::new(request.handle, error).write(writer)?;
    if let Some(data) = data {
        writer.write_all(&data)?;
    }
    writer.flush()?;
    Ok(true)
}

/// Client-side bytes for the handshake used by [`serve`]: fixed newstyle,
/// no zero padding, export chosen with NBD_OPT_EXPORT_NAME.
pub fn client_handshake<W: Write>(writer: &mut W, export_name: &str) -> io::Result<()> {
    writer.write_u32::<BigEndian>(NBD_FLAG_C_FIXED_NEWSTYLE | NBD_FLAG_C_NO_ZEROES)?;
    writer.write_u64::<BigEndian>(NBD_OPTS_MAGIC)?;
    writer.write_u32::<BigEndian>(NBD_OPT_EXPORT_NAME)?;
    writer.write_u32::<BigEndian>(export_name.len() as u32)?;
    writer.write_all(export_name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ModuleRegistry;
    use byteorder::ReadBytesExt;
    use std::io::Cursor;

    fn memory_chain(filters: &[&str]) -> Chain {
        let registry = ModuleRegistry::with_builtins();
        let top = registry.build("memory", filters).unwrap();
        Chain::compose(top, &["size=1M"]).unwrap()
    }

    fn request(command: NbdCommand, flags: u16, handle: u64, offset: u64, length: u32) -> NbdRequest {
        NbdRequest {
            flags,
            command: command as u16,
            handle,
            offset,
            length,
        }
    }

    /// Run a scripted client against `chain` and return the server's bytes
    /// after the handshake greeting, positioned at the export size.
    fn exchange(chain: &Chain, readonly: bool, script: &[u8]) -> Cursor<Vec<u8>> {
        let mut client = Vec::new();
        client_handshake(&mut client, "").unwrap();
        client.extend_from_slice(script);

        let config = NbdServerConfig {
            readonly,
            ..Default::default()
        };
        let scheduler = Scheduler::new(chain.thread_model());
        let mut output = Vec::new();
        serve(Cursor::new(client), &mut output, chain, &config, &scheduler).unwrap();

        let mut reply = Cursor::new(output);
        reply.set_position(8 + 8 + 2);
        reply
    }

    fn read_reply(reply: &mut Cursor<Vec<u8>>) -> NbdReply {
        let parsed = NbdReply::read(reply).unwrap();
        assert_eq!(parsed.magic, NBD_SIMPLE_REPLY_MAGIC);
        parsed
    }

    #[test]
    fn test_scheduler_runs_requests() {
        for model in [ThreadModel::SerializeAllRequests, ThreadModel::Parallel] {
            let scheduler = Scheduler::new(model);
            assert_eq!(scheduler.request(|| 7), 7);
            assert_eq!(scheduler.model(), model);
        }
    }

    #[test]
    fn test_write_read_zero_session() {
        let chain = memory_chain(&[]);
        let mut script = Vec::new();
        request(NbdCommand::Write, NBD_CMD_FLAG_FUA, 1, 4096, 512).write(&mut script).unwrap();
        script.extend_from_slice(&[0xab; 512]);
        request(NbdCommand::Read, 0, 2, 4096, 512).write(&mut script).unwrap();
        request(NbdCommand::WriteZeroes, NBD_CMD_FLAG_NO_HOLE, 3, 4096, 256)
            .write(&mut script)
            .unwrap();
        request(NbdCommand::Read, 0, 4, 4096, 512).write(&mut script).unwrap();
        request(NbdCommand::Flush, 0, 5, 0, 0).write(&mut script).unwrap();
        request(NbdCommand::Disc, 0, 6, 0, 0).write(&mut script).unwrap();

        let mut reply = exchange(&chain, false, &script);
        assert_eq!(reply.read_u64::<BigEndian>().unwrap(), 1 << 20);
        let flags = reply.read_u16::<BigEndian>().unwrap();
        assert_eq!(flags & NBD_FLAG_READ_ONLY, 0);
        assert_ne!(flags & NBD_FLAG_SEND_FLUSH, 0);
        assert_ne!(flags & NBD_FLAG_SEND_WRITE_ZEROES, 0);

        assert_eq!(read_reply(&mut reply), NbdReply::new(1, 0));

        assert_eq!(read_reply(&mut reply), NbdReply::new(2, 0));
        let mut data = [0u8; 512];
        reply.read_exact(&mut data).unwrap();
        assert!(data.iter().all(|&b| b == 0xab));

        assert_eq!(read_reply(&mut reply), NbdReply::new(3, 0));

        assert_eq!(read_reply(&mut reply), NbdReply::new(4, 0));
        reply.read_exact(&mut data).unwrap();
        assert!(data[..256].iter().all(|&b| b == 0));
        assert!(data[256..].iter().all(|&b| b == 0xab));

        assert_eq!(read_reply(&mut reply), NbdReply::new(5, 0));
        // Nothing after the disconnect
        assert_eq!(reply.position() as usize, reply.get_ref().len());
    }

    #[test]
    fn test_errors_are_mapped() {
        let chain = memory_chain(&[]);
        let mut script = Vec::new();
        request(NbdCommand::Read, 0, 1, (1 << 20) - 100, 512).write(&mut script).unwrap();
        NbdRequest {
            flags: 0,
            command: 42,
            handle: 2,
            offset: 0,
            length: 0,
        }
        .write(&mut script)
        .unwrap();
        request(NbdCommand::Read, 0, 3, 0, MAX_REQUEST_SIZE + 1).write(&mut script).unwrap();

        let mut reply = exchange(&chain, false, &script);
        reply.set_position(reply.position() + 10);
        assert_eq!(read_reply(&mut reply), NbdReply::new(1, NBD_EINVAL));
        assert_eq!(read_reply(&mut reply), NbdReply::new(2, NBD_EINVAL));
        assert_eq!(read_reply(&mut reply), NbdReply::new(3, NBD_EINVAL));
    }

    #[test]
    fn test_readonly_export() {
        let chain = memory_chain(&["readonly"]);
        let mut script = Vec::new();
        request(NbdCommand::Write, 0, 9, 0, 4).write(&mut script).unwrap();
        script.extend_from_slice(&[1, 2, 3, 4]);
        request(NbdCommand::Read, 0, 10, 0, 4).write(&mut script).unwrap();

        let mut reply = exchange(&chain, false, &script);
        reply.read_u64::<BigEndian>().unwrap();
        let flags = reply.read_u16::<BigEndian>().unwrap();
        assert_ne!(flags & NBD_FLAG_READ_ONLY, 0);
        assert_eq!(flags & NBD_FLAG_SEND_TRIM, 0);

        assert_eq!(read_reply(&mut reply), NbdReply::new(9, NBD_EPERM));
        assert_eq!(read_reply(&mut reply), NbdReply::new(10, 0));
        let mut data = [0xffu8; 4];
        reply.read_exact(&mut data).unwrap();
        assert_eq!(data, [0; 4]);
    }

    #[test]
    fn test_readonly_connection_flag() {
        let chain = memory_chain(&[]);
        let mut reply = exchange(&chain, true, &[]);
        reply.read_u64::<BigEndian>().unwrap();
        let flags = reply.read_u16::<BigEndian>().unwrap();
        assert_ne!(flags & NBD_FLAG_READ_ONLY, 0);
    }
}
