use crate::constants::{
    HEADER_SIZE, MSG_CARD_DATA_REQ, MSG_CLIENT_LOGIN, MSG_KEEPALIVE, NETMSG_SIZE,
};
use crate::crypto::LinkKey;
use crate::error::{CwcError, Result};

/**
    A decrypted message from the server.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub sequence: u16,
    pub service_id: u16,
    /// Payload from the message type byte on.
    pub body: Vec<u8>,
}

impl Inbound {
    pub fn kind(&self) -> u8 {
        self.body[0]
    }
}

/**
    Frame and encrypt `msg`. Returns the bytes to put on the wire.

    The plain frame is a 12-byte header (length, sequence, service id,
    reserved) followed by `msg`; the length field is written after
    encryption and counts everything but itself.
*/
pub fn seal(msg: &[u8], sequence: u16, service_id: u16, key: &LinkKey) -> Result<Vec<u8>> {
    if msg.len() + HEADER_SIZE > NETMSG_SIZE {
        return Err(CwcError::MessageTooLarge(msg.len()));
    }
    let mut buf = Vec::with_capacity(NETMSG_SIZE);
    buf.extend_from_slice(&[0u8; HEADER_SIZE]);
    buf[2..4].copy_from_slice(&sequence.to_be_bytes());
    buf[4..6].copy_from_slice(&service_id.to_be_bytes());
    buf.extend_from_slice(msg);

    key.encrypt(&mut buf)?;

    let len = (buf.len() - 2) as u16;
    buf[..2].copy_from_slice(&len.to_be_bytes());
    Ok(buf)
}

/**
    Decrypt a received frame (length prefix included) and split its header.
*/
pub fn open(mut frame: Vec<u8>, key: &LinkKey) -> Result<Inbound> {
    let len = key.decrypt(&mut frame)?;
    if len < HEADER_SIZE + 3 {
        return Err(CwcError::MessageTooShort(len));
    }
    frame.truncate(len);
    Ok(Inbound {
        sequence: u16::from_be_bytes([frame[2], frame[3]]),
        service_id: u16::from_be_bytes([frame[4], frame[5]]),
        body: frame.split_off(HEADER_SIZE),
    })
}

/**
    Declared length of a frame from its 2-byte prefix.
*/
pub fn frame_len(prefix: [u8; 2]) -> Result<usize> {
    let len = usize::from(u16::from_be_bytes(prefix));
    if len >= NETMSG_SIZE {
        return Err(CwcError::MessageTooLarge(len));
    }
    Ok(len)
}

/**
    `[0xe0, 0, len, username\0, password\0]`.
*/
pub fn login(username: &str, salted_password: &str) -> Result<Vec<u8>> {
    let len = username.len() + salted_password.len() + 2;
    if len > u8::MAX as usize {
        return Err(CwcError::MessageTooLarge(len));
    }
    let mut msg = Vec::with_capacity(len + 3);
    msg.push(MSG_CLIENT_LOGIN);
    msg.push(0);
    msg.push(len as u8);
    msg.extend_from_slice(username.as_bytes());
    msg.push(0);
    msg.extend_from_slice(salted_password.as_bytes());
    msg.push(0);
    Ok(msg)
}

pub fn card_data_request() -> [u8; 3] {
    [MSG_CARD_DATA_REQ, 0, 0]
}

pub fn keepalive() -> [u8; 3] {
    [MSG_KEEPALIVE, 0, 0]
}
