//! Minimal NBD client used by the backup client to push disk data into
//! the hub's block servers. Implements fixed-newstyle negotiation with
//! structured replies and the `base:allocation` metadata context, plus
//! the write-side transmission commands. Reads are never issued; backup
//! data only flows toward the hub.

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const NBDMAGIC: u64 = 0x4e42_444d_4147_4943; // "NBDMAGIC"
pub const IHAVEOPT: u64 = 0x4948_4156_454f_5054; // "IHAVEOPT"
pub const REP_MAGIC: u64 = 0x0003_e889_0455_65a9;
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

pub const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const FLAG_NO_ZEROES: u16 = 1 << 1;

pub const OPT_GO: u32 = 7;
pub const OPT_STRUCTURED_REPLY: u32 = 8;
pub const OPT_SET_META_CONTEXT: u32 = 10;

pub const REP_ACK: u32 = 1;
pub const REP_INFO: u32 = 3;
pub const REP_META_CONTEXT: u32 = 4;
pub const REP_FLAG_ERROR: u32 = 1 << 31;

pub const INFO_EXPORT: u16 = 0;

pub const CMD_WRITE: u16 = 1;
pub const CMD_DISC: u16 = 2;
pub const CMD_FLUSH: u16 = 3;

pub const META_CONTEXT_ALLOCATION: &str = "base:allocation";

#[derive(Error, Debug)]
pub enum NbdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server refused option {option}: reply {reply:#x}")]
    OptionRefused { option: u32, reply: u32 },

    #[error("server returned error {0} for command")]
    CommandError(u32),
}

/// Header for one transmission request. 28 bytes on the wire.
pub fn encode_request(flags: u16, cmd: u16, handle: u64, offset: u64, length: u32) -> [u8; 28] {
    let mut buf = [0u8; 28];
    buf[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
    buf[4..6].copy_from_slice(&flags.to_be_bytes());
    buf[6..8].copy_from_slice(&cmd.to_be_bytes());
    buf[8..16].copy_from_slice(&handle.to_be_bytes());
    buf[16..24].copy_from_slice(&offset.to_be_bytes());
    buf[24..28].copy_from_slice(&length.to_be_bytes());
    buf
}

/// Payload of NBD_OPT_GO: export name plus zero information requests.
pub fn encode_go_payload(export_name: &str) -> Vec<u8> {
    let name = export_name.as_bytes();
    let mut buf = Vec::with_capacity(4 + name.len() + 2);
    buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf
}

/// Payload of NBD_OPT_SET_META_CONTEXT for a single context query.
pub fn encode_meta_context_payload(export_name: &str, context: &str) -> Vec<u8> {
    let name = export_name.as_bytes();
    let query = context.as_bytes();
    let mut buf = Vec::with_capacity(4 + name.len() + 4 + 4 + query.len());
    buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(&1u32.to_be_bytes());
    buf.extend_from_slice(&(query.len() as u32).to_be_bytes());
    buf.extend_from_slice(query);
    buf
}

struct OptionReply {
    reply_type: u32,
    data: Vec<u8>,
}

/// One negotiated NBD connection in transmission phase.
pub struct NbdClient {
    stream: TcpStream,
    export_size: u64,
    next_handle: u64,
}

impl NbdClient {
    /// Connects and negotiates an export end to end: fixed-newstyle
    /// handshake, structured replies, the allocation metadata context,
    /// then NBD_OPT_GO. Returns a client in transmission phase.
    pub async fn connect(host: &str, port: u16, export_name: &str) -> Result<Self, NbdError> {
        let mut stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        let magic = stream.read_u64().await?;
        if magic != NBDMAGIC {
            return Err(NbdError::Protocol(format!("bad initial magic {:#x}", magic)));
        }
        let opt_magic = stream.read_u64().await?;
        if opt_magic != IHAVEOPT {
            return Err(NbdError::Protocol("server is not newstyle".to_string()));
        }

        let server_flags = stream.read_u16().await?;
        if server_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(NbdError::Protocol(
                "server lacks fixed-newstyle negotiation".to_string(),
            ));
        }
        let client_flags = (FLAG_FIXED_NEWSTYLE | (server_flags & FLAG_NO_ZEROES)) as u32;
        stream.write_u32(client_flags).await?;

        let mut client = Self {
            stream,
            export_size: 0,
            next_handle: 1,
        };

        // Structured replies first; the metadata context option depends
        // on them. An old server may refuse both, which only costs us
        // block-status capability.
        let structured = client.negotiate_structured_reply().await?;
        if structured {
            client.negotiate_meta_context(export_name).await?;
        }

        client.negotiate_go(export_name).await?;
        Ok(client)
    }

    async fn send_option(&mut self, option: u32, data: &[u8]) -> Result<(), NbdError> {
        self.stream.write_u64(IHAVEOPT).await?;
        self.stream.write_u32(option).await?;
        self.stream.write_u32(data.len() as u32).await?;
        if !data.is_empty() {
            self.stream.write_all(data).await?;
        }
        Ok(())
    }

    async fn read_option_reply(&mut self, option: u32) -> Result<OptionReply, NbdError> {
        let magic = self.stream.read_u64().await?;
        if magic != REP_MAGIC {
            return Err(NbdError::Protocol(format!("bad reply magic {:#x}", magic)));
        }
        let reply_option = self.stream.read_u32().await?;
        if reply_option != option {
            return Err(NbdError::Protocol(format!(
                "reply for option {} while awaiting {}",
                reply_option, option
            )));
        }
        let reply_type = self.stream.read_u32().await?;
        let length = self.stream.read_u32().await?;

        let mut data = vec![0u8; length as usize];
        if length > 0 {
            self.stream.read_exact(&mut data).await?;
        }

        Ok(OptionReply { reply_type, data })
    }

    async fn negotiate_structured_reply(&mut self) -> Result<bool, NbdError> {
        self.send_option(OPT_STRUCTURED_REPLY, &[]).await?;
        let reply = self.read_option_reply(OPT_STRUCTURED_REPLY).await?;
        match reply.reply_type {
            REP_ACK => Ok(true),
            t if t & REP_FLAG_ERROR != 0 => Ok(false),
            t => Err(NbdError::Protocol(format!(
                "unexpected structured-reply response {:#x}",
                t
            ))),
        }
    }

    async fn negotiate_meta_context(&mut self, export_name: &str) -> Result<(), NbdError> {
        let payload = encode_meta_context_payload(export_name, META_CONTEXT_ALLOCATION);
        self.send_option(OPT_SET_META_CONTEXT, &payload).await?;

        loop {
            let reply = self.read_option_reply(OPT_SET_META_CONTEXT).await?;
            match reply.reply_type {
                REP_META_CONTEXT => {
                    // u32 context id + name; we only log it.
                    if reply.data.len() > 4 {
                        log::debug!(
                            "Negotiated metadata context {}",
                            String::from_utf8_lossy(&reply.data[4..])
                        );
                    }
                }
                REP_ACK => return Ok(()),
                t if t & REP_FLAG_ERROR != 0 => {
                    // Context not offered; block status simply stays off.
                    log::debug!("Server declined metadata context ({:#x})", t);
                    return Ok(());
                }
                t => {
                    return Err(NbdError::Protocol(format!(
                        "unexpected meta-context response {:#x}",
                        t
                    )))
                }
            }
        }
    }

    async fn negotiate_go(&mut self, export_name: &str) -> Result<(), NbdError> {
        let payload = encode_go_payload(export_name);
        self.send_option(OPT_GO, &payload).await?;

        loop {
            let reply = self.read_option_reply(OPT_GO).await?;
            match reply.reply_type {
                REP_INFO => {
                    if reply.data.len() >= 12 {
                        let info_type = u16::from_be_bytes([reply.data[0], reply.data[1]]);
                        if info_type == INFO_EXPORT {
                            let mut size = [0u8; 8];
                            size.copy_from_slice(&reply.data[2..10]);
                            self.export_size = u64::from_be_bytes(size);
                        }
                    }
                }
                REP_ACK => {
                    if self.export_size == 0 {
                        return Err(NbdError::Protocol(
                            "server acknowledged GO without export info".to_string(),
                        ));
                    }
                    return Ok(());
                }
                t if t & REP_FLAG_ERROR != 0 => {
                    return Err(NbdError::OptionRefused {
                        option: OPT_GO,
                        reply: t,
                    })
                }
                t => {
                    return Err(NbdError::Protocol(format!(
                        "unexpected GO response {:#x}",
                        t
                    )))
                }
            }
        }
    }

    /// Virtual size of the negotiated export.
    pub fn size(&self) -> u64 {
        self.export_size
    }

    async fn read_command_reply(&mut self, handle: u64) -> Result<(), NbdError> {
        let magic = self.stream.read_u32().await?;
        match magic {
            SIMPLE_REPLY_MAGIC => {
                let error = self.stream.read_u32().await?;
                let reply_handle = self.stream.read_u64().await?;
                if reply_handle != handle {
                    return Err(NbdError::Protocol(format!(
                        "reply handle {} while awaiting {}",
                        reply_handle, handle
                    )));
                }
                if error != 0 {
                    return Err(NbdError::CommandError(error));
                }
                Ok(())
            }
            STRUCTURED_REPLY_MAGIC => {
                let _flags = self.stream.read_u16().await?;
                let reply_type = self.stream.read_u16().await?;
                let reply_handle = self.stream.read_u64().await?;
                let length = self.stream.read_u32().await?;
                let mut payload = vec![0u8; length as usize];
                if length > 0 {
                    self.stream.read_exact(&mut payload).await?;
                }
                if reply_handle != handle {
                    return Err(NbdError::Protocol(format!(
                        "reply handle {} while awaiting {}",
                        reply_handle, handle
                    )));
                }
                // Error chunk types have the high bit set.
                if reply_type & 0x8000 != 0 {
                    let error = if payload.len() >= 4 {
                        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                    } else {
                        0
                    };
                    return Err(NbdError::CommandError(error));
                }
                Ok(())
            }
            other => Err(NbdError::Protocol(format!("bad reply magic {:#x}", other))),
        }
    }

    /// Writes one extent at the given offset.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let handle = self.next_handle;
        self.next_handle += 1;

        let header = encode_request(0, CMD_WRITE, handle, offset, data.len() as u32);
        self.stream.write_all(&header).await?;
        self.stream.write_all(data).await?;
        self.read_command_reply(handle).await
    }

    /// Flushes everything written so far to the backing QCOW2.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        let handle = self.next_handle;
        self.next_handle += 1;

        let header = encode_request(0, CMD_FLUSH, handle, 0, 0);
        self.stream.write_all(&header).await?;
        self.read_command_reply(handle).await
    }

    /// Sends the disconnect command and closes the stream. The server
    /// does not reply to DISC.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        let handle = self.next_handle;
        let header = encode_request(0, CMD_DISC, handle, 0, 0);
        self.stream.write_all(&header).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nbd_magics_spell_their_ascii_names() {
        assert_eq!(&NBDMAGIC.to_be_bytes(), b"NBDMAGIC");
        assert_eq!(&IHAVEOPT.to_be_bytes(), b"IHAVEOPT");
    }

    #[test]
    fn request_header_layout_matches_the_wire_format() {
        let header = encode_request(0, CMD_WRITE, 7, 0x1000, 512);
        assert_eq!(&header[0..4], &REQUEST_MAGIC.to_be_bytes());
        assert_eq!(u16::from_be_bytes([header[6], header[7]]), CMD_WRITE);
        assert_eq!(
            u64::from_be_bytes(header[8..16].try_into().unwrap()),
            7u64
        );
        assert_eq!(
            u64::from_be_bytes(header[16..24].try_into().unwrap()),
            0x1000
        );
        assert_eq!(u32::from_be_bytes(header[24..28].try_into().unwrap()), 512);
    }

    #[test]
    fn go_payload_carries_export_name_and_no_info_requests() {
        let payload = encode_go_payload("alpha-disk0-T");
        assert_eq!(
            u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize,
            "alpha-disk0-T".len()
        );
        assert_eq!(&payload[4..17], b"alpha-disk0-T");
        assert_eq!(&payload[17..19], &0u16.to_be_bytes());
    }

    #[test]
    fn meta_context_payload_queries_base_allocation() {
        let payload = encode_meta_context_payload("e", META_CONTEXT_ALLOCATION);
        // name len + name + one query
        assert_eq!(u32::from_be_bytes(payload[0..4].try_into().unwrap()), 1);
        assert_eq!(payload[4], b'e');
        assert_eq!(u32::from_be_bytes(payload[5..9].try_into().unwrap()), 1);
        let query_len = u32::from_be_bytes(payload[9..13].try_into().unwrap()) as usize;
        assert_eq!(
            &payload[13..13 + query_len],
            META_CONTEXT_ALLOCATION.as_bytes()
        );
    }
}
