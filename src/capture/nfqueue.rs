//! NFQUEUE backend over a raw netfilter netlink socket

use super::{CapturedPacket, PacketQueue};
use crate::config::QueueConfig;
use crate::wire::{Timeval, Verdict};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, info, warn};

// netlink
const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;
const NLA_HDRLEN: usize = 4;
const NLA_TYPE_MASK: u16 = 0x3fff;

// nfnetlink
const NFGENMSG_LEN: usize = 4;
const NFNETLINK_V0: u8 = 0;
const NFNL_SUBSYS_QUEUE: u16 = 3;

// nfnetlink_queue messages
const NFQNL_MSG_PACKET: u16 = 0;
const NFQNL_MSG_VERDICT: u16 = 1;
const NFQNL_MSG_CONFIG: u16 = 2;

// packet attributes
const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_TIMESTAMP: u16 = 4;
const NFQA_IFINDEX_INDEV: u16 = 5;
const NFQA_PAYLOAD: u16 = 10;

// config attributes
const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_CFG_MASK: u16 = 4;
const NFQA_CFG_FLAGS: u16 = 5;
const NFQNL_CFG_CMD_BIND: u8 = 1;
const NFQNL_CFG_CMD_UNBIND: u8 = 2;
const NFQNL_COPY_PACKET: u8 = 2;
const NFQA_CFG_F_FAIL_OPEN: u32 = 0x01;

// netfilter verdicts
const NF_DROP: u32 = 0;
const NF_ACCEPT: u32 = 1;

/// Large enough for a full 64 KiB copy plus netlink headers
const RECV_BUFFER_SIZE: usize = 0x10000 + 8192;

/// A packet read from the queue (payload copied out of the receive buffer)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub packet_id: u32,
    pub hw_protocol: u16,
    pub hook: u8,
    pub indev: u32,
    pub timestamp: Option<Timeval>,
    pub payload: Option<Vec<u8>>,
}

impl CapturedPacket for QueuedPacket {
    fn packet_id(&self) -> u32 {
        self.packet_id
    }

    fn indev(&self) -> u32 {
        self.indev
    }

    fn timestamp(&self) -> Option<Timeval> {
        self.timestamp
    }

    fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}

/// Something the kernel sent us
#[derive(Debug)]
enum Event {
    Packet(QueuedPacket),
    /// NLMSG_ERROR; errno 0 is an acknowledgement
    Ack { seq: u32, errno: i32 },
}

/// Netfilter queue socket bound to one queue number
pub struct NfQueue {
    fd: RawFd,
    queue_num: u16,
    seq: u32,
    buffer: Vec<u8>,
    /// Packets that arrived while waiting for an ack
    pending: VecDeque<QueuedPacket>,
}

impl NfQueue {
    /// Open the netlink socket, bind the queue and set the copy mode
    pub fn open(config: &QueueConfig) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            )
        };

        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let mut queue = Self {
            fd,
            queue_num: config.num,
            seq: 0,
            buffer: vec![0u8; RECV_BUFFER_SIZE],
            pending: VecDeque::new(),
        };

        // From here on Drop closes the fd
        queue.bind_socket()?;
        queue.set_recv_timeout(config)?;

        info!("binding netfilter queue {}", config.num);
        queue.request(config_cmd(NFQNL_CFG_CMD_BIND))?;

        let mut params = Vec::with_capacity(5);
        params.extend_from_slice(&config.copy_range.to_be_bytes());
        params.push(NFQNL_COPY_PACKET);
        queue.request(vec![(NFQA_CFG_PARAMS, params)])?;

        if config.fail_open {
            let flags = NFQA_CFG_F_FAIL_OPEN.to_be_bytes().to_vec();
            queue.request(vec![(NFQA_CFG_MASK, flags.clone()), (NFQA_CFG_FLAGS, flags)])?;
            info!("kernel fail-open enabled for queue {}", config.num);
        }

        Ok(queue)
    }

    fn bind_socket(&self) -> Result<()> {
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        let ret = unsafe {
            libc::bind(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };

        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn set_recv_timeout(&self, config: &QueueConfig) -> Result<()> {
        let interval = config.poll_interval();
        let tv = libc::timeval {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_usec: interval.subsec_micros() as libc::suseconds_t,
        };

        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as u32,
            )
        };

        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send_raw(&self, message: &[u8]) -> Result<()> {
        let n = unsafe {
            libc::send(
                self.fd,
                message.as_ptr() as *const libc::c_void,
                message.len(),
                0,
            )
        };

        if n < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Receive one datagram into the buffer. `None` on timeout or ENOBUFS.
    fn recv_raw(&mut self) -> Result<Option<usize>> {
        let n = unsafe {
            libc::recv(
                self.fd,
                self.buffer.as_mut_ptr() as *mut libc::c_void,
                self.buffer.len(),
                0,
            )
        };

        if n >= 0 {
            return Ok(Some(n as usize));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
            Some(libc::ENOBUFS) => {
                warn!("netlink receive buffer overrun, kernel dropped queue messages");
                Ok(None)
            }
            _ => Err(Error::Io(err)),
        }
    }

    /// Send a config message and wait for its acknowledgement
    fn request(&mut self, attrs: Vec<(u16, Vec<u8>)>) -> Result<()> {
        let seq = self.next_seq();
        let mut message = NlMessage::new(NFQNL_MSG_CONFIG, NLM_F_REQUEST | NLM_F_ACK, self.queue_num);
        for (attr_type, data) in &attrs {
            message.put_attr(*attr_type, data);
        }
        self.send_raw(&message.finish(seq))?;

        loop {
            let Some(len) = self.recv_raw()? else {
                return Err(Error::Netlink(format!(
                    "no acknowledgement for config request {}",
                    seq
                )));
            };

            for event in parse_events(&self.buffer[..len])? {
                match event {
                    Event::Packet(packet) => self.pending.push_back(packet),
                    Event::Ack { seq: acked, errno } if acked == seq => {
                        if errno != 0 {
                            return Err(Error::Io(io::Error::from_raw_os_error(errno)));
                        }
                        return Ok(());
                    }
                    Event::Ack { seq: other, errno } => {
                        debug!(seq = other, errno, "unrelated netlink ack");
                    }
                }
            }
        }
    }
}

impl PacketQueue for NfQueue {
    type Packet = QueuedPacket;

    fn recv(&mut self) -> Result<Vec<QueuedPacket>> {
        if !self.pending.is_empty() {
            return Ok(self.pending.drain(..).collect());
        }

        let Some(len) = self.recv_raw()? else {
            return Ok(Vec::new());
        };

        let mut packets = Vec::new();
        for event in parse_events(&self.buffer[..len])? {
            match event {
                Event::Packet(packet) => packets.push(packet),
                Event::Ack { errno: 0, .. } => {}
                Event::Ack { seq, errno } => {
                    // Usually a verdict for a packet the kernel already let go
                    warn!(
                        seq,
                        "netlink error: {}",
                        io::Error::from_raw_os_error(errno)
                    );
                }
            }
        }
        Ok(packets)
    }

    fn set_verdict(&mut self, packet_id: u32, verdict: Verdict) -> Result<()> {
        let seq = self.next_seq();
        let message = verdict_message(self.queue_num, packet_id, verdict, seq);
        self.send_raw(&message)
    }
}

impl Drop for NfQueue {
    fn drop(&mut self) {
        let seq = self.next_seq();
        let mut message = NlMessage::new(NFQNL_MSG_CONFIG, NLM_F_REQUEST, self.queue_num);
        for (attr_type, data) in config_cmd(NFQNL_CFG_CMD_UNBIND) {
            message.put_attr(attr_type, &data);
        }
        if self.send_raw(&message.finish(seq)).is_ok() {
            info!("unbound netfilter queue {}", self.queue_num);
        }
        unsafe { libc::close(self.fd) };
    }
}

/// nfqnl_msg_config_cmd { command, pad, pf (unused by modern kernels) }
fn config_cmd(command: u8) -> Vec<(u16, Vec<u8>)> {
    vec![(NFQA_CFG_CMD, vec![command, 0, 0, 0])]
}

fn verdict_message(queue_num: u16, packet_id: u32, verdict: Verdict, seq: u32) -> Vec<u8> {
    let code = match verdict {
        Verdict::Drop => NF_DROP,
        Verdict::Accept => NF_ACCEPT,
    };

    let mut header = Vec::with_capacity(8);
    header.extend_from_slice(&code.to_be_bytes());
    header.extend_from_slice(&packet_id.to_be_bytes());

    let mut message = NlMessage::new(NFQNL_MSG_VERDICT, NLM_F_REQUEST, queue_num);
    message.put_attr(NFQA_VERDICT_HDR, &header);
    message.finish(seq)
}

/// Netlink message under construction: nlmsghdr + nfgenmsg + attributes
struct NlMessage {
    buffer: Vec<u8>,
}

impl NlMessage {
    fn new(msg: u16, flags: u16, queue_num: u16) -> Self {
        let msg_type = (NFNL_SUBSYS_QUEUE << 8) | msg;

        let mut buffer = Vec::with_capacity(64);
        buffer.extend_from_slice(&0u32.to_ne_bytes()); // length, patched in finish()
        buffer.extend_from_slice(&msg_type.to_ne_bytes());
        buffer.extend_from_slice(&flags.to_ne_bytes());
        buffer.extend_from_slice(&0u32.to_ne_bytes()); // seq
        buffer.extend_from_slice(&0u32.to_ne_bytes()); // port id, 0 = kernel

        buffer.push(libc::AF_UNSPEC as u8);
        buffer.push(NFNETLINK_V0);
        buffer.extend_from_slice(&queue_num.to_be_bytes());

        Self { buffer }
    }

    fn put_attr(&mut self, attr_type: u16, data: &[u8]) {
        let len = (NLA_HDRLEN + data.len()) as u16;
        self.buffer.extend_from_slice(&len.to_ne_bytes());
        self.buffer.extend_from_slice(&attr_type.to_ne_bytes());
        self.buffer.extend_from_slice(data);
        self.buffer.resize(align4(self.buffer.len()), 0);
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let len = self.buffer.len() as u32;
        self.buffer[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buffer[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buffer
    }
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn read_u16_ne(buf: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32_ne(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_u32_be(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_u64_be(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Split a netlink datagram into packets and acks
fn parse_events(buf: &[u8]) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let len = read_u32_ne(buf, offset) as usize;
        let msg_type = read_u16_ne(buf, offset + 4);
        let seq = read_u32_ne(buf, offset + 8);

        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return Err(Error::Netlink(format!(
                "truncated message: length {} at offset {} of {}",
                len,
                offset,
                buf.len()
            )));
        }
        let body = &buf[offset + NLMSG_HDRLEN..offset + len];

        match msg_type {
            NLMSG_ERROR => {
                if body.len() < 4 {
                    return Err(Error::Netlink("short error message".into()));
                }
                let error = read_u32_ne(body, 0) as i32;
                events.push(Event::Ack {
                    seq,
                    errno: -error,
                });
            }
            NLMSG_DONE => break,
            t if t == (NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET => {
                events.push(Event::Packet(parse_packet(body)?));
            }
            other => debug!(msg_type = other, "ignoring netlink message"),
        }

        offset += align4(len);
        if offset >= buf.len() {
            break;
        }
    }

    Ok(events)
}

/// Parse the body of an NFQNL_MSG_PACKET (after the nlmsghdr)
fn parse_packet(body: &[u8]) -> Result<QueuedPacket> {
    if body.len() < NFGENMSG_LEN {
        return Err(Error::Netlink("packet message without nfgenmsg".into()));
    }

    let mut header = None;
    let mut indev = 0;
    let mut timestamp = None;
    let mut payload = None;

    let mut offset = NFGENMSG_LEN;
    while body.len() - offset >= NLA_HDRLEN {
        let attr_len = read_u16_ne(body, offset) as usize;
        let attr_type = read_u16_ne(body, offset + 2) & NLA_TYPE_MASK;

        if attr_len < NLA_HDRLEN || offset + attr_len > body.len() {
            return Err(Error::Netlink(format!(
                "truncated attribute {} (length {})",
                attr_type, attr_len
            )));
        }
        let data = &body[offset + NLA_HDRLEN..offset + attr_len];

        match attr_type {
            // nfqnl_msg_packet_hdr { packet_id be32, hw_protocol be16, hook u8 }
            NFQA_PACKET_HDR if data.len() >= 7 => {
                header = Some((
                    read_u32_be(data, 0),
                    u16::from_be_bytes([data[4], data[5]]),
                    data[6],
                ));
            }
            NFQA_IFINDEX_INDEV if data.len() >= 4 => indev = read_u32_be(data, 0),
            // nfqnl_msg_packet_timestamp { sec be64, usec be64 }
            NFQA_TIMESTAMP if data.len() >= 16 => {
                timestamp = Some(Timeval::new(
                    read_u64_be(data, 0) as i64,
                    read_u64_be(data, 8) as i64,
                ));
            }
            NFQA_PAYLOAD => payload = Some(data.to_vec()),
            _ => {}
        }

        offset += align4(attr_len);
        if offset >= body.len() {
            break;
        }
    }

    let (packet_id, hw_protocol, hook) =
        header.ok_or_else(|| Error::Netlink("packet message without packet header".into()))?;

    Ok(QueuedPacket {
        packet_id,
        hw_protocol,
        hook,
        indev,
        timestamp,
        payload,
    })
}
