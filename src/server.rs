//! Minimal protocol handler on top of the connection core.
//!
//! Answers the handful of requests a client needs to connect, sync and
//! turn on big requests. Everything else gets BadRequest.

use x11os_core::{ByteOrder, ClientId, ConnectionManager, Dispatcher, ProtocolError, Request};
use x11rb_protocol::protocol::{bigreq, xproto};

/// Major opcode handed out for BIG-REQUESTS.
pub const BIGREQ_MAJOR: u8 = 133;

const VENDOR: &[u8] = b"x11os";
const RELEASE: u32 = 1;
const ROOT: u32 = 1;
const COLORMAP: u32 = 0x20;
const VISUAL: u32 = 0x21;
const WIDTH: u16 = 1280;
const HEIGHT: u16 = 720;

/// Little helper writing fields in the client's byte order.
struct Out {
    order: ByteOrder,
    buf: Vec<u8>,
}

impl Out {
    fn new(order: ByteOrder, capacity: usize) -> Self {
        Self {
            order,
            buf: Vec::with_capacity(capacity),
        }
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&self.order.u16_bytes(v));
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&self.order.u32_bytes(v));
        self
    }

    fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    fn zeros(&mut self, n: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + n, 0);
        self
    }

    /// Start a 32-byte reply with no extra data.
    fn reply(order: ByteOrder, data: u8, sequence: u16) -> Self {
        let mut out = Self::new(order, 32);
        out.u8(1).u8(data).u16(sequence).u32(0);
        out
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len();
        if len < 32 {
            self.zeros(32 - len);
        }
        self.buf
    }
}

#[derive(Debug, Default)]
pub struct Server {
    gone: usize,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clients closed since the server started.
    pub fn gone(&self) -> usize {
        self.gone
    }

    fn query_extension(order: ByteOrder, request: &Request<'_>) -> Result<Vec<u8>, ProtocolError> {
        let body = request.body();
        if body.len() < 4 {
            return Err(ProtocolError::length());
        }
        let len = order.read_u16(&body[0..2]) as usize;
        let name = body.get(4..4 + len).ok_or_else(ProtocolError::length)?;
        let present = name == bigreq::X11_EXTENSION_NAME.as_bytes();
        tracing::debug!("QueryExtension {}: {}", String::from_utf8_lossy(name), present);

        let mut out = Out::reply(order, 0, request.sequence());
        out.u8(u8::from(present))
            .u8(if present { BIGREQ_MAJOR } else { 0 })
            .u8(0)
            .u8(0);
        Ok(out.finish())
    }

    fn big_req_enable(
        os: &mut ConnectionManager,
        client: ClientId,
        order: ByteOrder,
        request: &Request<'_>,
    ) -> Vec<u8> {
        os.set_big_requests(client, true);
        let max = os.config().max_request_words;
        let mut out = Out::reply(order, 0, request.sequence());
        out.u32(max);
        out.finish()
    }

    fn get_input_focus(order: ByteOrder, request: &Request<'_>) -> Vec<u8> {
        // revert-to PointerRoot, focus on the root window
        let mut out = Out::reply(order, 1, request.sequence());
        out.u32(ROOT);
        out.finish()
    }
}

impl Dispatcher for Server {
    fn connection_block(&mut self, os: &ConnectionManager, client: ClientId) -> Vec<u8> {
        let order = os.byte_order(client).unwrap_or_default();
        let vendor_pad = x11os_core::wire::padding(VENDOR.len());
        let format_size = 8;
        let screen_size = 40;
        let depth_size = 8 + 24;
        let fixed_size = 32;
        let extra = fixed_size + VENDOR.len() + vendor_pad + format_size + screen_size + depth_size;
        let max_request = u16::try_from(os.config().max_request_words).unwrap_or(u16::MAX);

        let mut out = Out::new(order, 8 + extra);
        out.u8(1)
            .u8(0)
            .u16(11)
            .u16(0)
            .u16((extra / 4) as u16);

        out.u32(RELEASE)
            .u32(client.resource_base())
            .u32(ClientId::resource_mask())
            .u32(0)
            .u16(VENDOR.len() as u16)
            .u16(max_request)
            .u8(1) // screens
            .u8(1) // pixmap formats
            .u8(u8::from(order == ByteOrder::BigEndian)) // image byte order
            .u8(0) // bitmap bit order
            .u8(32) // scanline unit
            .u8(32) // scanline pad
            .u8(8) // min keycode
            .u8(255) // max keycode
            .zeros(4);

        out.bytes(VENDOR).zeros(vendor_pad);

        // depth 24, 32 bits per pixel
        out.u8(24).u8(32).u8(32).zeros(5);

        out.u32(ROOT)
            .u32(COLORMAP)
            .u32(0x00ff_ffff) // white
            .u32(0) // black
            .u32(0) // current input masks
            .u16(WIDTH)
            .u16(HEIGHT)
            .u16(WIDTH / 4)
            .u16(HEIGHT / 4)
            .u16(1)
            .u16(1)
            .u32(VISUAL)
            .u8(0) // backing stores: never
            .u8(0) // save unders
            .u8(24)
            .u8(1); // allowed depths

        out.u8(24).u8(0).u16(1).zeros(4);

        out.u32(VISUAL)
            .u8(4) // TrueColor
            .u8(8)
            .u16(256)
            .u32(0x00ff_0000)
            .u32(0x0000_ff00)
            .u32(0x0000_00ff)
            .zeros(4);

        out.buf
    }

    fn dispatch(
        &mut self,
        os: &mut ConnectionManager,
        client: ClientId,
        request: &Request<'_>,
    ) -> Result<(), ProtocolError> {
        let order = os.byte_order(client).unwrap_or_default();
        let reply = match request.major() {
            xproto::NO_OPERATION_REQUEST => return Ok(()),
            xproto::GRAB_SERVER_REQUEST => {
                os.only_listen_to_one_client(client);
                return Ok(());
            }
            xproto::UNGRAB_SERVER_REQUEST => {
                if os.grab() == Some(client) {
                    os.listen_to_all_clients();
                }
                return Ok(());
            }
            xproto::GET_INPUT_FOCUS_REQUEST => Self::get_input_focus(order, request),
            xproto::QUERY_EXTENSION_REQUEST => Self::query_extension(order, request)?,
            BIGREQ_MAJOR if request.minor() == bigreq::ENABLE_REQUEST => {
                Self::big_req_enable(os, client, order, request)
            }
            major => {
                tracing::trace!("{}: unhandled opcode {}", client, major);
                return Err(ProtocolError::request());
            }
        };
        // a failed write already marked the client for closing
        let _ = os.write_to_client(client, &reply);
        Ok(())
    }

    fn client_gone(&mut self, client: ClientId) {
        self.gone += 1;
        tracing::debug!("{} gone", client);
    }
}
