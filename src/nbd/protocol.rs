//! NBD protocol implementation
//!
//! Based on the NBD protocol specification:
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

use crate::backend::Flags;
use crate::connection::ExportInfo;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// NBD magic numbers
pub const NBD_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_OPT_REPLY_MAGIC: u64 = 0x3e889045565a9;

/// NBD handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

/// NBD client flags
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

/// NBD options
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;

/// NBD option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_ERR_UNSUP: u32 = (1 << 31) | 1;
pub const NBD_REP_ERR_INVALID: u32 = (1 << 31) | 3;

/// Longest option payload read into memory
pub const NBD_MAX_STRING: u32 = 4096;

/// NBD commands
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read = 0,
    Write = 1,
    Disc = 2, // Disconnect
    Flush = 3,
    Trim = 4,
    Cache = 5,
    WriteZeroes = 6,
}

impl NbdCommand {
    pub fn from_u16(val: u16) -> Option<Self> {
        match val {
            0 => Some(NbdCommand::Read),
            1 => Some(NbdCommand::Write),
            2 => Some(NbdCommand::Disc),
            3 => Some(NbdCommand::Flush),
            4 => Some(NbdCommand::Trim),
            5 => Some(NbdCommand::Cache),
            6 => Some(NbdCommand::WriteZeroes),
            _ => None,
        }
    }
}

/// NBD command flags
pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;
pub const NBD_CMD_FLAG_NO_HOLE: u16 = 1 << 1;
pub const NBD_CMD_FLAG_FAST_ZERO: u16 = 1 << 4;

/// NBD transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;
pub const NBD_FLAG_SEND_CACHE: u16 = 1 << 10;
pub const NBD_FLAG_SEND_FAST_ZERO: u16 = 1 << 11;

/// NBD error values
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EOVERFLOW: u32 = 75;
pub const NBD_ENOTSUP: u32 = 95;
pub const NBD_ESHUTDOWN: u32 = 108;

/// Map an errno onto the small set of errors NBD can carry
pub fn nbd_error(errno: i32) -> u32 {
    match errno {
        0 => 0,
        libc::EROFS | libc::EPERM => NBD_EPERM,
        libc::EIO => NBD_EIO,
        libc::ENOMEM => NBD_ENOMEM,
        libc::ENOSPC | libc::EFBIG | libc::EDQUOT => NBD_ENOSPC,
        libc::EOVERFLOW => NBD_EOVERFLOW,
        libc::EOPNOTSUPP => NBD_ENOTSUP,
        libc::ESHUTDOWN => NBD_ESHUTDOWN,
        _ => NBD_EINVAL,
    }
}

/// Transmission flags advertised for a negotiated export
pub fn transmission_flags(info: &ExportInfo) -> u16 {
    let mut flags = NBD_FLAG_HAS_FLAGS;
    if !info.can_write {
        flags |= NBD_FLAG_READ_ONLY;
    }
    let optional = [
        (info.can_flush, NBD_FLAG_SEND_FLUSH),
        (info.can_fua, NBD_FLAG_SEND_FUA),
        (info.is_rotational, NBD_FLAG_ROTATIONAL),
        (info.can_trim, NBD_FLAG_SEND_TRIM),
        (info.can_zero, NBD_FLAG_SEND_WRITE_ZEROES),
        (info.can_multi_conn, NBD_FLAG_CAN_MULTI_CONN),
        (info.can_cache, NBD_FLAG_SEND_CACHE),
        (info.can_fast_zero, NBD_FLAG_SEND_FAST_ZERO),
    ];
    for (enabled, flag) in optional {
        if enabled {
            flags |= flag;
        }
    }
    flags
}

/// NBD request
#[derive(Debug)]
pub struct NbdRequest {
    pub flags: u16,
    pub command: u16,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl NbdRequest {
    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        let magic = reader.read_u32::<BigEndian>()?;
        if magic != NBD_REQUEST_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid request magic: 0x{:08x}", magic),
            ));
        }

        let flags = reader.read_u16::<BigEndian>()?;
        let command = reader.read_u16::<BigEndian>()?;
        let handle = reader.read_u64::<BigEndian>()?;
        let offset = reader.read_u64::<BigEndian>()?;
        let length = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(NBD_REQUEST_MAGIC)?;
        writer.write_u16::<BigEndian>(self.flags)?;
        writer.write_u16::<BigEndian>(self.command)?;
        writer.write_u64::<BigEndian>(self.handle)?;
        writer.write_u64::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        Ok(())
    }

    pub fn command_type(&self) -> Option<NbdCommand> {
        NbdCommand::from_u16(self.command)
    }

    /// Backend flags for this request. NO_HOLE is inverted into MAY_TRIM
    /// for write-zeroes; flags that make no sense for the command are
    /// passed through so the chain rejects them.
    pub fn backend_flags(&self) -> Flags {
        let mut flags = Flags::empty();
        if self.flags & NBD_CMD_FLAG_FUA != 0 {
            flags |= Flags::FUA;
        }
        if self.command_type() == Some(NbdCommand::WriteZeroes) {
            if self.flags & NBD_CMD_FLAG_NO_HOLE == 0 {
                flags |= Flags::MAY_TRIM;
            }
            if self.flags & NBD_CMD_FLAG_FAST_ZERO != 0 {
                flags |= Flags::FAST_ZERO;
            }
        }
        flags
    }
}

/// NBD simple reply
#[derive(Debug, PartialEq, Eq)]
pub struct NbdReply {
    pub magic: u32,
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub fn new(handle: u64, error: u32) -> Self {
        Self {
            magic: NBD_SIMPLE_REPLY_MAGIC,
            error,
            handle,
        }
    }

    pub fn read<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            magic: reader.read_u32::<BigEndian>()?,
            error: reader.read_u32::<BigEndian>()?,
            handle: reader.read_u64::<BigEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.magic)?;
        writer.write_u32::<BigEndian>(self.error)?;
        writer.write_u64::<BigEndian>(self.handle)?;
        Ok(())
    }
}

fn write_option_reply<W: Write>(
    writer: &mut W,
    option: u32,
    reply: u32,
    data: &[u8],
) -> io::Result<()> {
    writer.write_u64::<BigEndian>(NBD_OPT_REPLY_MAGIC)?;
    writer.write_u32::<BigEndian>(option)?;
    writer.write_u32::<BigEndian>(reply)?;
    writer.write_u32::<BigEndian>(data.len() as u32)?;
    writer.write_all(data)?;
    writer.flush()
}

/// Run the fixed newstyle handshake.
///
/// `export` is called once the client has chosen an export; it opens
/// the export and returns its size and transmission flags.
pub fn send_newstyle_handshake<R, W, E>(
    reader: &mut R,
    writer: &mut W,
    export_name: &str,
    export: E,
) -> io::Result<()>
where
    R: Read,
    W: Write,
    E: FnOnce(&str) -> io::Result<(u64, u16)>,
{
    // Send initial greeting
    writer.write_u64::<BigEndian>(NBD_MAGIC)?;
    writer.write_u64::<BigEndian>(NBD_OPTS_MAGIC)?;

    // Server flags: support fixed newstyle
    let handshake_flags = NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES;
    writer.write_u16::<BigEndian>(handshake_flags)?;
    writer.flush()?;

    // Read client flags
    let client_flags = reader.read_u32::<BigEndian>()?;

    log::debug!("Client flags: 0x{:08x}", client_flags);

    // Negotiate options
    loop {
        // Read option header
        let opts_magic = reader.read_u64::<BigEndian>()?;
        if opts_magic != NBD_OPTS_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid option magic: 0x{:016x}", opts_magic),
            ));
        }

        let option = reader.read_u32::<BigEndian>()?;
        let option_len = reader.read_u32::<BigEndian>()?;

        log::debug!("Option: {}, length: {}", option, option_len);

        if option_len > NBD_MAX_STRING {
            let skipped = io::copy(&mut reader.by_ref().take(option_len as u64), &mut io::sink())?;
            if skipped != option_len as u64 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if option == NBD_OPT_EXPORT_NAME {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("export name of {} bytes is too long", option_len),
                ));
            }
            log::debug!("Option {} rejected: length {} too long", option, option_len);
            write_option_reply(writer, option, NBD_REP_ERR_INVALID, &[])?;
            continue;
        }

        let mut option_data = vec![0u8; option_len as usize];
        reader.read_exact(&mut option_data)?;

        match option {
            NBD_OPT_EXPORT_NAME => {
                let requested = String::from_utf8_lossy(&option_data);
                log::debug!("Export name: {:?}", requested);

                let (size, trans_flags) = export(&requested)?;

                // Send export info (no option reply for EXPORT_NAME)
                writer.write_u64::<BigEndian>(size)?;
                writer.write_u16::<BigEndian>(trans_flags)?;

                // If client supports NO_ZEROES, don't send padding
                if (client_flags & NBD_FLAG_C_NO_ZEROES) == 0 {
                    writer.write_all(&[0u8; 124])?;
                }

                writer.flush()?;

                // EXPORT_NAME ends negotiation
                return Ok(());
            }

            NBD_OPT_LIST => {
                let mut data = Vec::with_capacity(4 + export_name.len());
                data.write_u32::<BigEndian>(export_name.len() as u32)?;
                data.extend_from_slice(export_name.as_bytes());
                write_option_reply(writer, option, NBD_REP_SERVER, &data)?;
                write_option_reply(writer, option, NBD_REP_ACK, &[])?;
            }

            NBD_OPT_ABORT => {
                write_option_reply(writer, option, NBD_REP_ACK, &[])?;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "client aborted connection",
                ));
            }

            _ => {
                write_option_reply(writer, option, NBD_REP_ERR_UNSUP, &[])?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_nbd_error_mapping() {
        assert_eq!(nbd_error(0), 0);
        assert_eq!(nbd_error(libc::EROFS), NBD_EPERM);
        assert_eq!(nbd_error(libc::EIO), NBD_EIO);
        assert_eq!(nbd_error(libc::ENOSPC), NBD_ENOSPC);
        assert_eq!(nbd_error(libc::EOPNOTSUPP), NBD_ENOTSUP);
        assert_eq!(nbd_error(libc::EBADF), NBD_EINVAL);
    }

    #[test]
    fn test_transmission_flags() {
        let info = ExportInfo {
            size: 1024,
            can_write: false,
            ..Default::default()
        };
        assert_eq!(transmission_flags(&info), NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY);

        let info = ExportInfo {
            size: 1024,
            can_write: true,
            can_flush: true,
            can_fua: true,
            can_zero: true,
            can_fast_zero: true,
            can_multi_conn: true,
            ..Default::default()
        };
        let flags = transmission_flags(&info);
        assert_eq!(flags & NBD_FLAG_READ_ONLY, 0);
        assert_ne!(flags & NBD_FLAG_SEND_FLUSH, 0);
        assert_ne!(flags & NBD_FLAG_SEND_FUA, 0);
        assert_ne!(flags & NBD_FLAG_SEND_WRITE_ZEROES, 0);
        assert_ne!(flags & NBD_FLAG_SEND_FAST_ZERO, 0);
        assert_ne!(flags & NBD_FLAG_CAN_MULTI_CONN, 0);
        assert_eq!(flags & NBD_FLAG_SEND_TRIM, 0);
        assert_eq!(flags & NBD_FLAG_SEND_CACHE, 0);
    }

    #[test]
    fn test_request_parse_and_flags() {
        let request = NbdRequest {
            flags: NBD_CMD_FLAG_FUA | NBD_CMD_FLAG_FAST_ZERO,
            command: NbdCommand::WriteZeroes as u16,
            handle: 0x1122334455667788,
            offset: 4096,
            length: 512,
        };
        let mut bytes = Vec::new();
        request.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 28);

        let parsed = NbdRequest::read(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(parsed.command_type(), Some(NbdCommand::WriteZeroes));
        assert_eq!(parsed.handle, 0x1122334455667788);
        assert_eq!(
            parsed.backend_flags(),
            Flags::FUA | Flags::MAY_TRIM | Flags::FAST_ZERO
        );

        let no_hole = NbdRequest {
            flags: NBD_CMD_FLAG_NO_HOLE,
            ..parsed
        };
        assert_eq!(no_hole.backend_flags(), Flags::empty());

        let write = NbdRequest {
            flags: NBD_CMD_FLAG_FUA | NBD_CMD_FLAG_NO_HOLE,
            command: NbdCommand::Write as u16,
            ..no_hole
        };
        assert_eq!(write.backend_flags(), Flags::FUA);
    }

    #[test]
    fn test_bad_request_magic() {
        let mut bytes = vec![0u8; 28];
        bytes[0] = 0xff;
        let err = NbdRequest::read(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_handshake_export_name() {
        let mut client = Vec::new();
        client.write_u32::<BigEndian>(NBD_FLAG_C_FIXED_NEWSTYLE | NBD_FLAG_C_NO_ZEROES).unwrap();
        // Unsupported option first
        client.write_u64::<BigEndian>(NBD_OPTS_MAGIC).unwrap();
        client.write_u32::<BigEndian>(99).unwrap();
        client.write_u32::<BigEndian>(0).unwrap();
        client.write_u64::<BigEndian>(NBD_OPTS_MAGIC).unwrap();
        client.write_u32::<BigEndian>(NBD_OPT_EXPORT_NAME).unwrap();
        client.write_u32::<BigEndian>(4).unwrap();
        client.extend_from_slice(b"disk");

        let mut server = Vec::new();
        let mut chosen = String::new();
        send_newstyle_handshake(&mut Cursor::new(client), &mut server, "disk", |name| {
            chosen = name.to_string();
            Ok((1 << 20, NBD_FLAG_HAS_FLAGS))
        })
        .unwrap();
        assert_eq!(chosen, "disk");

        let mut reply = Cursor::new(server);
        assert_eq!(reply.read_u64::<BigEndian>().unwrap(), NBD_MAGIC);
        assert_eq!(reply.read_u64::<BigEndian>().unwrap(), NBD_OPTS_MAGIC);
        assert_eq!(
            reply.read_u16::<BigEndian>().unwrap(),
            NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES
        );
        assert_eq!(reply.read_u64::<BigEndian>().unwrap(), NBD_OPT_REPLY_MAGIC);
        assert_eq!(reply.read_u32::<BigEndian>().unwrap(), 99);
        assert_eq!(reply.read_u32::<BigEndian>().unwrap(), NBD_REP_ERR_UNSUP);
        assert_eq!(reply.read_u32::<BigEndian>().unwrap(), 0);
        assert_eq!(reply.read_u64::<BigEndian>().unwrap(), 1 << 20);
        assert_eq!(reply.read_u16::<BigEndian>().unwrap(), NBD_FLAG_HAS_FLAGS);
        // No padding with NO_ZEROES
        assert_eq!(reply.position() as usize, reply.get_ref().len());
    }

    #[test]
    fn test_handshake_oversized_option_is_skipped() {
        let mut client = Vec::new();
        client.write_u32::<BigEndian>(NBD_FLAG_C_FIXED_NEWSTYLE | NBD_FLAG_C_NO_ZEROES).unwrap();
        client.write_u64::<BigEndian>(NBD_OPTS_MAGIC).unwrap();
        client.write_u32::<BigEndian>(NBD_OPT_LIST).unwrap();
        client.write_u32::<BigEndian>(NBD_MAX_STRING + 1).unwrap();
        client.extend_from_slice(&vec![0xaa; NBD_MAX_STRING as usize + 1]);
        client.write_u64::<BigEndian>(NBD_OPTS_MAGIC).unwrap();
        client.write_u32::<BigEndian>(NBD_OPT_EXPORT_NAME).unwrap();
        client.write_u32::<BigEndian>(0).unwrap();

        let mut server = Vec::new();
        send_newstyle_handshake(&mut Cursor::new(client), &mut server, "", |_| {
            Ok((4096, NBD_FLAG_HAS_FLAGS))
        })
        .unwrap();

        let mut reply = Cursor::new(server);
        reply.set_position(8 + 8 + 2);
        assert_eq!(reply.read_u64::<BigEndian>().unwrap(), NBD_OPT_REPLY_MAGIC);
        assert_eq!(reply.read_u32::<BigEndian>().unwrap(), NBD_OPT_LIST);
        assert_eq!(reply.read_u32::<BigEndian>().unwrap(), NBD_REP_ERR_INVALID);
        assert_eq!(reply.read_u32::<BigEndian>().unwrap(), 0);
        assert_eq!(reply.read_u64::<BigEndian>().unwrap(), 4096);
    }

    #[test]
    fn test_handshake_oversized_export_name_fails() {
        let mut client = Vec::new();
        client.write_u32::<BigEndian>(NBD_FLAG_C_FIXED_NEWSTYLE).unwrap();
        client.write_u64::<BigEndian>(NBD_OPTS_MAGIC).unwrap();
        client.write_u32::<BigEndian>(NBD_OPT_EXPORT_NAME).unwrap();
        client.write_u32::<BigEndian>(u32::MAX).unwrap();

        let mut server = Vec::new();
        let mut opened = false;
        let err = send_newstyle_handshake(&mut Cursor::new(client), &mut server, "", |_| {
            opened = true;
            Ok((0, NBD_FLAG_HAS_FLAGS))
        })
        .unwrap_err();
        // The payload was never sent, so skipping it runs out of input
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(!opened);
    }

    #[test]
    fn test_handshake_abort() {
        let mut client = Vec::new();
        client.write_u32::<BigEndian>(NBD_FLAG_C_FIXED_NEWSTYLE).unwrap();
        client.write_u64::<BigEndian>(NBD_OPTS_MAGIC).unwrap();
        client.write_u32::<BigEndian>(NBD_OPT_ABORT).unwrap();
        client.write_u32::<BigEndian>(0).unwrap();

        let mut server = Vec::new();
        let err = send_newstyle_handshake(&mut Cursor::new(client), &mut server, "", |_| {
            Ok((0, NBD_FLAG_HAS_FLAGS))
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }
}
