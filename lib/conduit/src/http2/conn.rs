use crate::chain::ChainCursor;
use crate::codec::{self, sections, Composed};
use crate::delivery::{Delivery, Disposition};
use crate::http2::frame::{self, error_codes, flags, FrameHeader, FrameKind, FRAME_HEADER_LEN, PREFACE};
use crate::http2::hpack;
use crate::message::{Content, Depth, DepthCheck, Message, RaPolicy, StreamDataResult};
use crate::transport::{Transport, ALPN_H2};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use std::sync::Arc;
use weft::logging::{self, Logger};

/// RFC default connection window until WINDOW_UPDATE adjusts it.
const DEFAULT_WINDOW: i64 = 65535;

/// Replenish receive windows once they fall below this.
const WINDOW_REFILL_THRESHOLD: i64 = (frame::INITIAL_WINDOW_SIZE / 2) as i64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum StreamStatus {
    Open,
    HalfClosed,
    FullyClosed,
}

impl StreamStatus {
    /// Stream status only ever moves forward.
    fn advance(&mut self, to: StreamStatus) {
        if to < *self {
            panic!("Attempted a backward stream status transition");
        }

        *self = to;
    }
}

/// One HTTP/2 stream mapped onto a delivery pair: the request flows out
/// through `in_delivery`, the response comes back on `out_delivery`.
pub struct Stream {
    id: u32,
    status: StreamStatus,
    in_delivery: Option<Arc<Delivery>>,
    out_delivery: Option<Arc<Delivery>>,
    header_composed: bool,
    footer_pending: bool,
    routed: bool,
    body_pending: Vec<u8>,
    data_unsent: Vec<u8>,
    bytes_in: u64,
    bytes_out: u64,
    send_window: i64,
    recv_window: i64,
    end_stream_sent: bool,
    deferred: bool,
}

impl Stream {
    fn new(id: u32, remote_initial_window: i64) -> Stream {
        Stream {
            id,
            status: StreamStatus::Open,
            in_delivery: None,
            out_delivery: None,
            header_composed: false,
            footer_pending: false,
            routed: false,
            body_pending: Vec::new(),
            data_unsent: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
            send_window: remote_initial_window,
            recv_window: frame::INITIAL_WINDOW_SIZE as i64,
            end_stream_sent: false,
            deferred: false,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn status(&self) -> StreamStatus {
        self.status
    }

    #[inline]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    #[inline]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }
}

/// What the router glue needs to act on after a `drive` pass.
#[derive(Debug)]
pub enum H2Event {
    /// A request message exists and wants routing to `address`.
    RequestReady {
        stream_id: u32,
        delivery: Arc<Delivery>,
        address: String,
    },
    /// The request body is complete.
    RequestComplete { stream_id: u32 },
    /// The stream died before completion; its deliveries were detached.
    RequestAborted { stream_id: u32 },
    /// The connection failed; `reason` is the canonical error string.
    ConnectionFailed { error: u32, reason: &'static str },
}

/// Continuation accumulation for a header block split across frames.
struct PendingHeaders {
    stream_id: u32,
    end_stream: bool,
    block: Vec<u8>,
}

/// One HTTP/2 connection layered over a raw transport: the SETTINGS
/// handshake, the per-stream state machines, the HPACK contexts, and both
/// levels of flow-control window, mapped onto message build/flow/abort
/// operations.
pub struct Http2Connection {
    transport: Transport,
    virtual_address: String,
    max_message_size: u64,

    decoder: hpack::Decoder,

    preface_seen: bool,
    settings_sent: bool,
    failed: bool,

    streams: HashMap<u32, Stream>,
    last_remote_stream_id: u32,

    goaway_sent: Option<u32>,
    goaway_received: Option<u32>,

    send_window: i64,
    recv_window: i64,
    remote_initial_window: i64,
    remote_max_frame: u32,

    events: Vec<H2Event>,
    pending_headers: Option<PendingHeaders>,

    log: Logger,
}

impl Http2Connection {
    /// Wrap a raw transport. The transport must have negotiated `h2` via
    /// ALPN; a mismatch fails the connection with GOAWAY(PROTOCOL_ERROR)
    /// before any frame is read.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        transport: Transport,
        virtual_address: &str,
        max_message_size: u64,
        log: L,
    ) -> Http2Connection {
        let mut conn = Http2Connection {
            transport,
            virtual_address: virtual_address.to_string(),
            max_message_size,
            decoder: hpack::Decoder::new(),
            preface_seen: false,
            settings_sent: false,
            failed: false,
            streams: HashMap::new(),
            last_remote_stream_id: 0,
            goaway_sent: None,
            goaway_received: None,
            send_window: DEFAULT_WINDOW,
            recv_window: frame::INITIAL_WINDOW_SIZE as i64,
            remote_initial_window: DEFAULT_WINDOW,
            remote_max_frame: frame::MAX_FRAME_SIZE,
            events: Vec::new(),
            pending_headers: None,
            log: logging::component(log.into(), "http2"),
        };

        if conn.transport.alpn() != Some(ALPN_H2) {
            logging::debug!(conn.log, "alpn mismatch";
                            "context" => "new",
                            "alpn" => conn.transport.alpn().unwrap_or("<none>"));
            conn.connection_error(error_codes::PROTOCOL_ERROR);
        }

        conn
    }

    #[inline]
    pub fn transport(&mut self) -> &mut Transport {
        &mut self.transport
    }

    #[inline]
    pub fn stream_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.streams.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[inline]
    pub fn stream_status(&self, stream_id: u32) -> Option<StreamStatus> {
        self.streams.get(&stream_id).map(Stream::status)
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Drain the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<H2Event> {
        std::mem::replace(&mut self.events, Vec::new())
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    /// Process everything buffered on the transport's read side. Never
    /// blocks; partial frames stay queued for the next pass.
    pub fn drive(&mut self) {
        if self.failed {
            return;
        }

        if !self.preface_seen {
            let mut preface = [0u8; 24];

            if !self.transport.read.peek_exact(&mut preface) {
                return;
            }

            if preface != PREFACE[..] {
                self.connection_error(error_codes::PROTOCOL_ERROR);
                return;
            }

            self.transport.read.consume(PREFACE.len());
            self.preface_seen = true;
            self.send_settings();
        }

        loop {
            let mut raw = [0u8; FRAME_HEADER_LEN];

            if !self.transport.read.peek_exact(&mut raw) {
                break;
            }

            let header = FrameHeader::parse(&raw);

            if header.length > frame::MAX_FRAME_SIZE {
                self.connection_error(error_codes::FRAME_SIZE_ERROR);
                return;
            }

            let total = FRAME_HEADER_LEN + header.length as usize;

            if self.transport.read.len() < total {
                break;
            }

            let payload = self.transport.read.octets()[FRAME_HEADER_LEN..total].to_vec();
            self.transport.read.consume(total);

            self.dispatch(header, &payload);

            if self.failed {
                return;
            }
        }

        self.maybe_close();
    }

    fn dispatch(&mut self, header: FrameHeader, payload: &[u8]) {
        // A split header block admits only its own continuations.
        if let Some(pending) = &self.pending_headers {
            let continues = header.kind == FrameKind::Continuation && header.stream_id == pending.stream_id;

            if !continues {
                self.connection_error(error_codes::PROTOCOL_ERROR);
                return;
            }
        }

        match header.kind {
            FrameKind::Data => self.on_data(header, payload),
            FrameKind::Headers => self.on_headers(header, payload),
            FrameKind::Continuation => self.on_continuation(header, payload),
            FrameKind::RstStream => self.on_rst_stream(header, payload),
            FrameKind::Settings => self.on_settings(header, payload),
            FrameKind::Ping => self.on_ping(header, payload),
            FrameKind::Goaway => self.on_goaway(payload),
            FrameKind::WindowUpdate => self.on_window_update(header, payload),
            // PRIORITY and unknown extension frames are ignored.
            FrameKind::Priority | FrameKind::Unknown(_) => (),
            FrameKind::PushPromise => self.connection_error(error_codes::PROTOCOL_ERROR),
        }
    }

    fn on_headers(&mut self, header: FrameHeader, payload: &[u8]) {
        if header.stream_id == 0 || header.stream_id % 2 == 0 {
            self.connection_error(error_codes::PROTOCOL_ERROR);
            return;
        }

        let mut block = payload;

        // Strip padding and the optional priority fields.
        if header.flags & flags::PADDED != 0 {
            if block.is_empty() || block[0] as usize + 1 > block.len() {
                self.connection_error(error_codes::PROTOCOL_ERROR);
                return;
            }

            let pad = block[0] as usize;
            block = &block[1..block.len() - pad];
        }

        if header.flags & flags::PRIORITY != 0 {
            if block.len() < 5 {
                self.connection_error(error_codes::PROTOCOL_ERROR);
                return;
            }

            block = &block[5..];
        }

        let end_stream = header.flags & flags::END_STREAM != 0;

        if header.flags & flags::END_HEADERS == 0 {
            self.pending_headers = Some(PendingHeaders {
                stream_id: header.stream_id,
                end_stream,
                block: block.to_vec(),
            });
            return;
        }

        self.complete_header_block(header.stream_id, end_stream, block.to_vec());
    }

    fn on_continuation(&mut self, header: FrameHeader, payload: &[u8]) {
        let mut pending = match self.pending_headers.take() {
            Some(pending) => pending,
            None => {
                self.connection_error(error_codes::PROTOCOL_ERROR);
                return;
            }
        };

        pending.block.extend_from_slice(payload);

        if header.flags & flags::END_HEADERS == 0 {
            self.pending_headers = Some(pending);
            return;
        }

        self.complete_header_block(pending.stream_id, pending.end_stream, pending.block);
    }

    fn complete_header_block(&mut self, stream_id: u32, end_stream: bool, block: Vec<u8>) {
        let headers = match self.decoder.decode(&block) {
            Ok(headers) => headers,
            Err(_) => {
                self.connection_error(error_codes::COMPRESSION_ERROR);
                return;
            }
        };

        if self.streams.contains_key(&stream_id) {
            // Request trailers: the body ends here.
            if end_stream {
                self.finish_request(stream_id);
            }
            return;
        }

        // New streams are refused once shutdown has begun or the
        // concurrency cap is reached.
        if self.goaway_sent.is_some() || self.goaway_received.is_some() {
            self.send_rst_stream(stream_id, error_codes::REFUSED_STREAM);
            return;
        }

        if self.streams.len() >= frame::MAX_CONCURRENT_STREAMS as usize {
            self.send_rst_stream(stream_id, error_codes::REFUSED_STREAM);
            return;
        }

        if stream_id <= self.last_remote_stream_id {
            self.connection_error(error_codes::PROTOCOL_ERROR);
            return;
        }

        self.last_remote_stream_id = stream_id;

        let mut stream = Stream::new(stream_id, self.remote_initial_window);

        let delivery = self.build_request_delivery(stream_id, &headers, end_stream);
        stream.in_delivery = Some(delivery.clone());

        if end_stream {
            stream.status.advance(StreamStatus::HalfClosed);
        }

        logging::debug!(self.log, "stream opened";
                        "context" => "on_headers",
                        "stream_id" => stream_id,
                        "end_stream" => end_stream);

        self.streams.insert(stream_id, stream);

        self.events.push(H2Event::RequestReady {
            stream_id,
            delivery,
            address: self.virtual_address.clone(),
        });

        if end_stream {
            self.events.push(H2Event::RequestComplete { stream_id });
        }
    }

    /// Compose the AMQP shape of a request: HEADER and PROPERTIES with
    /// `:method` as the subject and `:path` as the address, every other
    /// header mapped into application-properties.
    fn build_request_delivery(&self, stream_id: u32, headers: &[(String, String)], end_stream: bool) -> Arc<Delivery> {
        let mut method = "";
        let mut path = "/";
        let mut content_type = None;

        let mut application = Vec::new();

        for (name, value) in headers {
            match name.as_str() {
                ":method" => method = value,
                ":path" => path = value,
                "content-type" => content_type = Some(value.clone()),
                _ => application.push((name.clone(), value.clone())),
            }
        }

        let mut composed = Composed::new();

        composed.put_descriptor(sections::HEADER);
        composed.start_list();
        composed.put_bool(false);
        composed.end();

        composed.put_descriptor(sections::PROPERTIES);
        composed.start_list();
        composed.put_null();
        composed.put_null();
        composed.put_str(path);
        composed.put_str(method);
        composed.put_null();
        composed.put_null();
        match content_type {
            Some(content_type) => composed.put_sym(&content_type),
            None => composed.put_null(),
        }
        composed.end();

        composed.put_descriptor(sections::APPLICATION_PROPERTIES);
        composed.start_map();
        for (name, value) in &application {
            composed.put_str(name);
            composed.put_str(value);
        }
        composed.end();

        let content = Content::new(RaPolicy::Forbidden, self.max_message_size);
        let _ = content.extend(composed.octets());

        if end_stream {
            content.set_receive_complete();
        }

        let mut message = Message::new(content);
        message.set_streaming();

        let delivery = Delivery::new(message, 0);
        delivery.set_context(u64::from(stream_id));

        delivery
    }

    fn on_data(&mut self, header: FrameHeader, payload: &[u8]) {
        let mut body = payload;

        if header.flags & flags::PADDED != 0 {
            if body.is_empty() || body[0] as usize + 1 > body.len() {
                self.connection_error(error_codes::PROTOCOL_ERROR);
                return;
            }

            let pad = body[0] as usize;
            body = &body[1..body.len() - pad];
        }

        // Connection-level receive accounting covers the whole payload,
        // padding included.
        let consumed = payload.len() as i64;
        self.recv_window -= consumed;

        if self.recv_window < WINDOW_REFILL_THRESHOLD {
            let refill = frame::INITIAL_WINDOW_SIZE as i64 - self.recv_window;
            self.send_window_update(0, refill as u32);
            self.recv_window += refill;
        }

        match self.streams.get(&header.stream_id).map(Stream::status) {
            None => {
                // Data for a stream freed by GOAWAY or RST is dropped on
                // the floor; data for a stream that never existed is a
                // protocol violation.
                if header.stream_id > self.last_remote_stream_id {
                    self.connection_error(error_codes::PROTOCOL_ERROR);
                }
                return;
            }
            Some(StreamStatus::Open) => (),
            Some(_) => {
                self.send_rst_stream(header.stream_id, error_codes::STREAM_CLOSED);
                return;
            }
        }

        let refill = {
            let stream = self.streams.get_mut(&header.stream_id).expect("Stream vanished");

            stream.bytes_in += body.len() as u64;
            stream.recv_window -= consumed;

            match stream.recv_window < WINDOW_REFILL_THRESHOLD {
                true => {
                    let refill = frame::INITIAL_WINDOW_SIZE as i64 - stream.recv_window;
                    stream.recv_window += refill;
                    Some(refill as u32)
                }
                false => None,
            }
        };

        if let Some(refill) = refill {
            self.send_window_update(header.stream_id, refill);
        }

        let oversize = {
            let stream = self.streams.get_mut(&header.stream_id).expect("Stream vanished");

            if stream.routed {
                // Routed: streaming append straight into the message.
                match &stream.in_delivery {
                    Some(delivery) => {
                        let mut section = Composed::new();
                        section.put_descriptor(sections::BODY_DATA);
                        section.put_binary(body);

                        delivery.content().extend(section.octets()).is_err()
                    }
                    None => false,
                }
            } else {
                // Not routed yet: accumulate and splice on first route.
                stream.body_pending.extend_from_slice(body);
                false
            }
        };

        if oversize {
            // The size ceiling rejects the request permanently.
            self.request_disposition(header.stream_id, Disposition::Rejected);
            return;
        }

        if header.flags & flags::END_STREAM != 0 {
            self.finish_request(header.stream_id);
        }
    }

    /// The router glue routed the request delivery; splice any body
    /// accumulated while it waited.
    pub fn mark_routed(&mut self, stream_id: u32) {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        stream.routed = true;

        if stream.body_pending.is_empty() {
            return;
        }

        let body = std::mem::replace(&mut stream.body_pending, Vec::new());

        let oversize = match &stream.in_delivery {
            Some(delivery) => {
                let mut section = Composed::new();
                section.put_descriptor(sections::BODY_DATA);
                section.put_binary(&body);

                delivery.content().extend(section.octets()).is_err()
            }
            None => false,
        };

        if oversize {
            self.request_disposition(stream_id, Disposition::Rejected);
        }
    }

    fn finish_request(&mut self, stream_id: u32) {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        if let Some(delivery) = &stream.in_delivery {
            delivery.content().set_receive_complete();
        }

        if stream.status == StreamStatus::Open {
            stream.status.advance(StreamStatus::HalfClosed);
        }

        self.events.push(H2Event::RequestComplete { stream_id });
    }

    fn on_rst_stream(&mut self, header: FrameHeader, payload: &[u8]) {
        if payload.len() != 4 || header.stream_id == 0 {
            self.connection_error(error_codes::FRAME_SIZE_ERROR);
            return;
        }

        let code = BigEndian::read_u32(payload);

        logging::debug!(self.log, "stream reset by peer";
                        "context" => "on_rst_stream",
                        "stream_id" => header.stream_id,
                        "error" => frame::strerror(code));

        self.free_stream(header.stream_id);
    }

    fn on_settings(&mut self, header: FrameHeader, payload: &[u8]) {
        if header.stream_id != 0 {
            self.connection_error(error_codes::PROTOCOL_ERROR);
            return;
        }

        if header.flags & flags::ACK != 0 {
            return;
        }

        if payload.len() % 6 != 0 {
            self.connection_error(error_codes::FRAME_SIZE_ERROR);
            return;
        }

        for entry in payload.chunks(6) {
            let identifier = BigEndian::read_u16(&entry[0..2]);
            let value = BigEndian::read_u32(&entry[2..6]);

            match identifier {
                frame::settings::INITIAL_WINDOW_SIZE => {
                    let delta = i64::from(value) - self.remote_initial_window;
                    self.remote_initial_window = i64::from(value);

                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                frame::settings::MAX_FRAME_SIZE => {
                    self.remote_max_frame = value.min(frame::MAX_FRAME_SIZE);
                }
                _ => (),
            }
        }

        let mut out = Vec::new();
        frame::write_frame(&mut out, FrameKind::Settings, flags::ACK, 0, &[]);
        self.transport.write.push(&out);
    }

    fn on_ping(&mut self, header: FrameHeader, payload: &[u8]) {
        if payload.len() != 8 {
            self.connection_error(error_codes::FRAME_SIZE_ERROR);
            return;
        }

        if header.flags & flags::ACK != 0 {
            return;
        }

        let mut out = Vec::new();
        frame::write_frame(&mut out, FrameKind::Ping, flags::ACK, 0, payload);
        self.transport.write.push(&out);
    }

    fn on_goaway(&mut self, payload: &[u8]) {
        if payload.len() < 8 {
            self.connection_error(error_codes::FRAME_SIZE_ERROR);
            return;
        }

        let last_stream_id = BigEndian::read_u32(&payload[0..4]) & 0x7FFF_FFFF;

        logging::debug!(self.log, "goaway received";
                        "context" => "on_goaway",
                        "last_stream_id" => last_stream_id);

        self.goaway_received = Some(last_stream_id);
        self.release_streams_above(last_stream_id);
        self.maybe_close();
    }

    fn on_window_update(&mut self, header: FrameHeader, payload: &[u8]) {
        if payload.len() != 4 {
            self.connection_error(error_codes::FRAME_SIZE_ERROR);
            return;
        }

        let increment = i64::from(BigEndian::read_u32(payload) & 0x7FFF_FFFF);

        if increment == 0 {
            self.connection_error(error_codes::PROTOCOL_ERROR);
            return;
        }

        if header.stream_id == 0 {
            self.send_window += increment;

            let waiting: Vec<u32> = self
                .streams
                .iter()
                .filter(|(_, stream)| stream.deferred || !stream.data_unsent.is_empty())
                .map(|(id, _)| *id)
                .collect();

            for stream_id in waiting {
                self.pump_stream(stream_id);
            }
        } else if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.send_window += increment;
            self.pump_stream(header.stream_id);
        }
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    /// Attach the response delivery the forwarder routed back to this
    /// stream, and start pumping it out.
    pub fn attach_response(&mut self, stream_id: u32, delivery: Arc<Delivery>) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            delivery.set_context(u64::from(stream_id));
            stream.out_delivery = Some(delivery);
            self.pump_stream(stream_id);
        }
    }

    /// Explicit resumption after new response body arrived; the data
    /// producer returns deferred instead of blocking, and this is the
    /// matching wake-up.
    pub fn resume_data(&mut self, stream_id: u32) {
        self.pump_stream(stream_id);
    }

    /// Apply the terminal disposition of the routed request when no
    /// response message will come: released or modified consumers map to
    /// 503, rejection to 400.
    pub fn request_disposition(&mut self, stream_id: u32, disposition: Disposition) {
        let status = match disposition {
            Disposition::Released | Disposition::Modified => "503",
            Disposition::Rejected => "400",
            Disposition::Accepted | Disposition::None => return,
        };

        match self.streams.get(&stream_id) {
            Some(stream) if !stream.header_composed => (),
            _ => return,
        }

        logging::debug!(self.log, "synthesizing error response";
                        "context" => "request_disposition",
                        "stream_id" => stream_id,
                        "status" => status);

        let headers = vec![
            (":status".to_string(), status.to_string()),
            ("content-length".to_string(), "0".to_string()),
        ];

        let block = hpack::encode(&headers);
        let mut out = Vec::new();
        frame::write_frame(
            &mut out,
            FrameKind::Headers,
            flags::END_HEADERS | flags::END_STREAM,
            stream_id,
            &block,
        );
        self.transport.write.push(&out);

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.header_composed = true;
            stream.end_stream_sent = true;

            // The request keeps the disposition that produced the
            // synthesized response.
            if let Some(delivery) = &stream.in_delivery {
                delivery.set_local_disposition(disposition);
            }
        }

        self.complete_stream(stream_id);
    }

    /// Drive the response of one stream as far as windows, transport
    /// capacity and buffered body allow. Never blocks: exhausted input or
    /// output defers, and resumption is explicit.
    fn pump_stream(&mut self, stream_id: u32) {
        let content = match self.streams.get(&stream_id) {
            Some(stream) => match &stream.out_delivery {
                Some(delivery) => delivery.content(),
                None => return,
            },
            None => return,
        };

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.deferred = false;
        }

        if !self.compose_response_header(stream_id, &content) {
            return;
        }

        loop {
            // Flush any segment remainder held back by windows or
            // capacity.
            if !self.flush_data_unsent(stream_id) {
                return;
            }

            if self.streams.get(&stream_id).is_none() {
                return;
            }

            match content.stream_data_next() {
                StreamDataResult::BodyOk(segment) => {
                    let mut payload = vec![0u8; segment.payload_length as usize];
                    let copied = content.read_chunk(segment.payload_offset, &mut payload);
                    payload.truncate(copied);
                    content.stream_data_release(segment.id);

                    let stream = self.streams.get_mut(&stream_id).expect("Stream vanished");
                    stream.data_unsent = payload;
                }
                StreamDataResult::FooterOk(segment) => {
                    let trailers = Self::decode_footer(&content, segment.section_offset);
                    content.stream_data_release(segment.id);

                    let block = hpack::encode(&trailers);
                    let mut out = Vec::new();
                    frame::write_frame(
                        &mut out,
                        FrameKind::Headers,
                        flags::END_HEADERS | flags::END_STREAM,
                        stream_id,
                        &block,
                    );
                    self.transport.write.push(&out);

                    let stream = self.streams.get_mut(&stream_id).expect("Stream vanished");
                    stream.footer_pending = false;
                    stream.end_stream_sent = true;

                    self.complete_stream(stream_id);
                    return;
                }
                StreamDataResult::Incomplete => {
                    self.defer(stream_id);
                    return;
                }
                StreamDataResult::NoMore => {
                    let mut out = Vec::new();
                    frame::write_frame(&mut out, FrameKind::Data, flags::END_STREAM, stream_id, &[]);
                    self.transport.write.push(&out);

                    let stream = self.streams.get_mut(&stream_id).expect("Stream vanished");
                    stream.end_stream_sent = true;

                    self.complete_stream(stream_id);
                    return;
                }
                StreamDataResult::Aborted => {
                    self.send_rst_stream(stream_id, error_codes::CANCEL);
                    self.free_stream(stream_id);
                    return;
                }
                StreamDataResult::Invalid => {
                    self.send_rst_stream(stream_id, error_codes::INTERNAL_ERROR);
                    self.free_stream(stream_id);
                    return;
                }
            }
        }
    }

    /// Emit the response HEADERS once the properties section is readable.
    /// Returns false when the pump cannot continue.
    fn compose_response_header(&mut self, stream_id: u32, content: &Arc<Content>) -> bool {
        match self.streams.get(&stream_id) {
            Some(stream) if stream.header_composed => return true,
            Some(_) => (),
            None => return false,
        }

        match content.check_depth(Depth::Properties) {
            DepthCheck::Ok => (),
            DepthCheck::Incomplete => {
                self.defer(stream_id);
                return false;
            }
            DepthCheck::Invalid => {
                self.send_rst_stream(stream_id, error_codes::INTERNAL_ERROR);
                self.free_stream(stream_id);
                return false;
            }
        }

        let status = Self::response_status(content);
        let no_body = content.has_no_body() && content.is_receive_complete();

        let mut headers = vec![(":status".to_string(), status)];

        if no_body {
            headers.push(("content-length".to_string(), "0".to_string()));
        }

        let block = hpack::encode(&headers);
        let mut frame_flags = flags::END_HEADERS;

        if no_body {
            frame_flags |= flags::END_STREAM;
        }

        let mut out = Vec::new();
        frame::write_frame(&mut out, FrameKind::Headers, frame_flags, stream_id, &block);
        self.transport.write.push(&out);

        let stream = self.streams.get_mut(&stream_id).expect("Stream vanished");
        stream.header_composed = true;

        if no_body {
            stream.end_stream_sent = true;
            self.complete_stream(stream_id);
            return false;
        }

        true
    }

    /// Write as much of the held-back segment as both windows and the
    /// transport allow. Returns true when nothing is held back any more.
    fn flush_data_unsent(&mut self, stream_id: u32) -> bool {
        loop {
            let (unsent_len, stream_window) = match self.streams.get(&stream_id) {
                Some(stream) => (stream.data_unsent.len(), stream.send_window),
                None => return false,
            };

            if unsent_len == 0 {
                return true;
            }

            let capacity = self.transport.write.free_capacity();

            if capacity <= FRAME_HEADER_LEN {
                self.defer(stream_id);
                return false;
            }

            let budget = (capacity - FRAME_HEADER_LEN)
                .min(self.remote_max_frame as usize)
                .min(unsent_len);

            let window = self.send_window.min(stream_window);

            if window <= 0 {
                // Window exhaustion resumes on WINDOW_UPDATE.
                return false;
            }

            let take = budget.min(window as usize);

            let chunk: Vec<u8> = {
                let stream = self.streams.get_mut(&stream_id).expect("Stream vanished");
                stream.data_unsent.drain(..take).collect()
            };

            let mut out = Vec::new();
            frame::write_frame(&mut out, FrameKind::Data, 0, stream_id, &chunk);
            self.transport.write.push(&out);

            self.send_window -= take as i64;

            let stream = self.streams.get_mut(&stream_id).expect("Stream vanished");
            stream.send_window -= take as i64;
            stream.bytes_out += take as u64;
        }
    }

    /// The `:status` of the response is carried in the message subject.
    fn response_status(content: &Arc<Content>) -> String {
        let subject = content.section(Depth::Properties).and_then(|properties| {
            content.with_chain(|chain| {
                let mut cursor = ChainCursor::new_at(properties.value.offset);
                let (count, _) = codec::read_list_header(chain, &mut cursor).ok()?;

                if count < 4 {
                    return None;
                }

                // message-id, user-id, to, then the subject.
                codec::scan_primitive(chain, &mut cursor).ok()?;
                codec::scan_primitive(chain, &mut cursor).ok()?;
                codec::scan_primitive(chain, &mut cursor).ok()?;
                codec::read_str(chain, &mut cursor).ok()?
            })
        });

        match subject {
            Some(subject) if subject.parse::<u16>().is_ok() => subject,
            _ => "200".to_string(),
        }
    }

    /// A trailing footer map becomes HTTP trailers.
    fn decode_footer(content: &Arc<Content>, section_offset: u64) -> Vec<(String, String)> {
        content.with_chain(|chain| {
            let mut trailers = Vec::new();
            let mut cursor = ChainCursor::new_at(section_offset);

            if cursor.read_u8(chain) != Some(codec::tags::DESCRIBED) {
                return trailers;
            }

            if codec::read_descriptor(chain, &mut cursor).is_err() {
                return trailers;
            }

            let (count, _) = match codec::read_map_header(chain, &mut cursor) {
                Ok(header) => header,
                Err(_) => return trailers,
            };

            for _ in 0..count / 2 {
                let key = codec::read_str(chain, &mut cursor);
                let value = codec::read_str(chain, &mut cursor);

                match (key, value) {
                    (Ok(Some(key)), Ok(Some(value))) => trailers.push((key, value)),
                    _ => break,
                }
            }

            trailers
        })
    }

    // ------------------------------------------------------------------
    // Stream teardown
    // ------------------------------------------------------------------

    fn defer(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.deferred = true;
        }
    }

    /// Normal completion: the response went out in full.
    fn complete_stream(&mut self, stream_id: u32) {
        let stream = match self.streams.get_mut(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        stream.status.advance(StreamStatus::FullyClosed);

        if let Some(delivery) = stream.in_delivery.take() {
            delivery.set_local_disposition(Disposition::Accepted);
            delivery.clear_context();
            delivery.settle();
        }

        if let Some(delivery) = stream.out_delivery.take() {
            delivery.set_local_disposition(Disposition::Accepted);
            delivery.clear_context();
            delivery.settle();
        }

        logging::debug!(self.log, "stream complete";
                        "context" => "complete_stream",
                        "stream_id" => stream_id,
                        "bytes_in" => stream.bytes_in,
                        "bytes_out" => stream.bytes_out);

        self.streams.remove(&stream_id);
        self.maybe_close();
    }

    /// Abortive teardown (peer RST or internal failure): the response
    /// delivery is rejected, the request delivery detached. Deliveries
    /// are detached exactly here, before the stream record drops, so a
    /// later disposition for the stream finds nothing to touch.
    fn free_stream(&mut self, stream_id: u32) {
        let mut stream = match self.streams.remove(&stream_id) {
            Some(stream) => stream,
            None => return,
        };

        if let Some(delivery) = stream.out_delivery.take() {
            delivery.set_local_disposition(Disposition::Rejected);
            delivery.clear_context();
            delivery.settle();
        }

        if let Some(delivery) = stream.in_delivery.take() {
            delivery.clear_context();
            delivery.settle();
        }

        self.events.push(H2Event::RequestAborted { stream_id });
        self.maybe_close();
    }

    /// GOAWAY teardown for streams above the watermark: release rather
    /// than reject, so the forwarder may re-route them.
    fn release_streams_above(&mut self, last_stream_id: u32) {
        let doomed: Vec<u32> = self
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last_stream_id)
            .collect();

        for stream_id in doomed {
            let mut stream = match self.streams.remove(&stream_id) {
                Some(stream) => stream,
                None => continue,
            };

            if let Some(delivery) = stream.in_delivery.take() {
                delivery.set_local_disposition(Disposition::Released);
                delivery.clear_context();
                delivery.settle();
            }

            if let Some(delivery) = stream.out_delivery.take() {
                delivery.set_local_disposition(Disposition::Released);
                delivery.clear_context();
                delivery.settle();
            }

            self.events.push(H2Event::RequestAborted { stream_id });
        }
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    fn send_settings(&mut self) {
        if self.settings_sent {
            return;
        }

        let payload = frame::local_settings_payload();
        let mut out = Vec::new();
        frame::write_frame(&mut out, FrameKind::Settings, 0, 0, &payload);
        self.transport.write.push(&out);
        self.settings_sent = true;
    }

    fn send_rst_stream(&mut self, stream_id: u32, code: u32) {
        let mut payload = [0u8; 4];
        BigEndian::write_u32(&mut payload, code);

        let mut out = Vec::new();
        frame::write_frame(&mut out, FrameKind::RstStream, 0, stream_id, &payload);
        self.transport.write.push(&out);
    }

    fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        let mut payload = [0u8; 4];
        BigEndian::write_u32(&mut payload, increment);

        let mut out = Vec::new();
        frame::write_frame(&mut out, FrameKind::WindowUpdate, 0, stream_id, &payload);
        self.transport.write.push(&out);
    }

    /// Graceful server-initiated shutdown: streams above `last_stream_id`
    /// are disowned and released, the rest run to completion, and the raw
    /// connection closes once they do. No new stream may start.
    pub fn shutdown(&mut self, last_stream_id: u32) {
        if self.goaway_sent.is_some() {
            return;
        }

        let payload = frame::goaway_payload(last_stream_id, error_codes::NO_ERROR, frame::strerror(error_codes::NO_ERROR));
        let mut out = Vec::new();
        frame::write_frame(&mut out, FrameKind::Goaway, 0, 0, &payload);
        self.transport.write.push(&out);

        self.goaway_sent = Some(last_stream_id);
        self.release_streams_above(last_stream_id);
        self.maybe_close();
    }

    /// Abortive shutdown with an error code and its canonical reason
    /// string.
    pub fn goaway(&mut self, error: u32) {
        if self.goaway_sent.is_some() {
            return;
        }

        let payload = frame::goaway_payload(self.last_remote_stream_id, error, frame::strerror(error));
        let mut out = Vec::new();
        frame::write_frame(&mut out, FrameKind::Goaway, 0, 0, &payload);
        self.transport.write.push(&out);

        self.goaway_sent = Some(self.last_remote_stream_id);
        self.maybe_close();
    }

    fn connection_error(&mut self, error: u32) {
        logging::debug!(self.log, "connection failed";
                        "context" => "connection_error",
                        "reason" => frame::strerror(error));

        self.goaway(error);
        self.failed = true;

        self.release_streams_above(0);

        self.events.push(H2Event::ConnectionFailed {
            error,
            reason: frame::strerror(error),
        });

        self.transport.close();
    }

    fn maybe_close(&mut self) {
        let shutting_down = self.goaway_sent.is_some() || self.goaway_received.is_some();

        if shutting_down && self.streams.is_empty() {
            self.transport.close();
        }
    }
}
