//! Session stream buffers
//!
//! The send path stages serialized packets in a plaintext buffer; once
//! encryption is active, staged bytes are padded to the cipher block
//! boundary with a dedicated padding packet, run through the block
//! cipher into a second buffer, and flushed from there. Encryption
//! deliberately lags submission: a small urgent packet is accepted into
//! the plaintext buffer even while the encrypt buffer is backed up, and
//! a full encrypt buffer fails the flush explicitly instead of growing.
//!
//! The receive path mirrors it: raw bytes accumulate, complete cipher
//! blocks are transformed into a decrypt buffer as they arrive, and the
//! framer hands out complete packets while shifting leftover partial
//! bytes to the front. A malformed frame is an error the session must
//! treat as fatal.

use bytes::Bytes;
use weftnet_crypto::constants::BLOCK_SIZE;
use weftnet_crypto::{BlockDecryptor, BlockEncryptor, SessionKey};
use weftnet_net::wire::{Packet, PacketKind, HEADER_SIZE};

use crate::error::{CoreError, CoreResult};

/// Outbound half of a session stream
pub struct SendChannel {
    plain: Vec<u8>,
    encrypted: Vec<u8>,
    cipher: Option<BlockEncryptor>,
    plain_capacity: usize,
    encrypted_capacity: usize,
}

impl SendChannel {
    pub fn new(plain_capacity: usize, encrypted_capacity: usize) -> Self {
        Self {
            plain: Vec::new(),
            encrypted: Vec::new(),
            cipher: None,
            plain_capacity,
            encrypted_capacity,
        }
    }

    /// Stage a packet for transmission
    pub fn queue(&mut self, packet: &Packet) -> CoreResult<()> {
        let needed = packet.size();
        let available = self.plain_capacity - self.plain.len();
        if needed > available {
            return Err(CoreError::SendBufferFull { needed, available });
        }
        packet.write_to(&mut self.plain);
        Ok(())
    }

    /// All bytes staged from here on are encrypted before flushing.
    /// The caller must have flushed staged plaintext first; the
    /// encryption-start marker separates the two regimes on the wire.
    pub fn activate_encryption(&mut self, key: &SessionKey) {
        debug_assert!(
            self.plain.is_empty(),
            "plaintext staged across encryption activation"
        );
        self.cipher = Some(BlockEncryptor::new(key));
    }

    pub fn encryption_active(&self) -> bool {
        self.cipher.is_some()
    }

    /// Whether nothing is staged or pending
    pub fn is_idle(&self) -> bool {
        self.plain.is_empty() && self.encrypted.is_empty()
    }

    fn padded_len(len: usize) -> usize {
        let rem = len % BLOCK_SIZE;
        if rem == 0 {
            return len;
        }
        let mut pad = BLOCK_SIZE - rem;
        // A padding packet needs room for its own header; when fewer
        // bytes than that remain in the block, pad through the next.
        if pad < HEADER_SIZE {
            pad += BLOCK_SIZE;
        }
        len + pad
    }

    /// Pad and encrypt staged plaintext into the encrypt buffer
    fn encrypt_pending(&mut self) -> CoreResult<()> {
        let cipher = match &mut self.cipher {
            Some(cipher) => cipher,
            None => return Ok(()),
        };
        if self.plain.is_empty() {
            return Ok(());
        }

        let padded = Self::padded_len(self.plain.len());
        let available = self.encrypted_capacity - self.encrypted.len();
        if padded > available {
            return Err(CoreError::EncryptBufferFull {
                needed: padded,
                available,
            });
        }

        let pad = padded - self.plain.len();
        if pad > 0 {
            Packet::padding(pad).write_to(&mut self.plain);
        }
        debug_assert_eq!(self.plain.len() % BLOCK_SIZE, 0);

        cipher.encrypt_blocks(&mut self.plain)?;
        self.encrypted.extend_from_slice(&self.plain);
        self.plain.clear();
        Ok(())
    }

    /// Take everything ready for the wire, or None when idle
    pub fn take_flush(&mut self) -> CoreResult<Option<Bytes>> {
        if self.cipher.is_some() {
            self.encrypt_pending()?;
            if self.encrypted.is_empty() {
                return Ok(None);
            }
            Ok(Some(Bytes::from(std::mem::take(&mut self.encrypted))))
        } else {
            if self.plain.is_empty() {
                return Ok(None);
            }
            Ok(Some(Bytes::from(std::mem::take(&mut self.plain))))
        }
    }
}

/// Inbound half of a session stream
pub struct RecvChannel {
    raw: Vec<u8>,
    decrypted: Vec<u8>,
    cipher: Option<BlockDecryptor>,
    capacity: usize,
}

impl RecvChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            raw: Vec::new(),
            decrypted: Vec::new(),
            cipher: None,
            capacity,
        }
    }

    /// Accumulate raw bytes from the transport
    pub fn ingest(&mut self, bytes: &[u8]) -> CoreResult<()> {
        if self.raw.len() + bytes.len() > self.capacity {
            return Err(CoreError::RecvBufferFull);
        }
        self.raw.extend_from_slice(bytes);
        Ok(())
    }

    /// All raw bytes from here on are ciphertext. Called when the
    /// encryption-start marker is parsed; bytes already buffered behind
    /// the marker are ciphertext and stay queued for decryption.
    pub fn activate_decryption(&mut self, key: &SessionKey) {
        self.cipher = Some(BlockDecryptor::new(key));
    }

    pub fn decryption_active(&self) -> bool {
        self.cipher.is_some()
    }

    /// Parse the next complete packet, transparently consuming padding
    /// frames. Returns None when no complete packet is buffered; a
    /// malformed frame is an error the session treats as fatal.
    pub fn next_packet(&mut self) -> CoreResult<Option<Packet>> {
        loop {
            if let Some(cipher) = &mut self.cipher {
                let whole = (self.raw.len() / BLOCK_SIZE) * BLOCK_SIZE;
                if whole > 0 {
                    cipher.decrypt_blocks(&mut self.raw[..whole])?;
                    self.decrypted.extend_from_slice(&self.raw[..whole]);
                    self.raw.drain(..whole);
                }
            }

            let buf = if self.cipher.is_some() {
                &mut self.decrypted
            } else {
                &mut self.raw
            };

            match Packet::parse(buf) {
                Ok(Some((packet, consumed))) => {
                    buf.drain(..consumed);
                    if packet.kind == PacketKind::Padding {
                        continue;
                    }
                    return Ok(Some(packet));
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(CoreError::MalformedFrame(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channels() -> (SendChannel, RecvChannel) {
        (SendChannel::new(64 * 1024, 64 * 1024), RecvChannel::new(64 * 1024))
    }

    fn data_packet(len: usize) -> Packet {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Packet::new(PacketKind::Data, payload)
    }

    fn pump(send: &mut SendChannel, recv: &mut RecvChannel) -> Vec<Packet> {
        if let Some(chunk) = send.take_flush().unwrap() {
            recv.ingest(&chunk).unwrap();
        }
        let mut out = Vec::new();
        while let Some(packet) = recv.next_packet().unwrap() {
            out.push(packet);
        }
        out
    }

    #[test]
    fn test_plaintext_roundtrip() {
        let (mut send, mut recv) = channels();

        let packets = vec![data_packet(0), data_packet(5), data_packet(300)];
        for p in &packets {
            send.queue(p).unwrap();
        }

        assert_eq!(pump(&mut send, &mut recv), packets);
    }

    #[test]
    fn test_encrypted_roundtrip_arbitrary_sequence() {
        let (mut send, mut recv) = channels();
        let key = SessionKey::generate();
        send.activate_encryption(&key);
        recv.activate_decryption(&key);

        let packets: Vec<Packet> = [0usize, 1, 13, 16, 31, 64, 100, 1000]
            .iter()
            .map(|&n| data_packet(n))
            .collect();
        for p in &packets {
            send.queue(p).unwrap();
        }

        assert_eq!(pump(&mut send, &mut recv), packets);
    }

    #[test]
    fn test_padding_exact_header_edge() {
        // Packet size 13 leaves block_size - 3 bytes staged short of a
        // block: the padding packet is exactly its bare header.
        let (mut send, mut recv) = channels();
        let key = SessionKey::generate();
        send.activate_encryption(&key);
        recv.activate_decryption(&key);

        let packet = data_packet(13 - HEADER_SIZE);
        assert_eq!(packet.size() % BLOCK_SIZE, 13);
        send.queue(&packet).unwrap();

        let chunk = send.take_flush().unwrap().unwrap();
        assert_eq!(chunk.len(), BLOCK_SIZE);

        recv.ingest(&chunk).unwrap();
        assert_eq!(recv.next_packet().unwrap().unwrap(), packet);
        assert!(recv.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_padding_smaller_than_header_spills_a_block() {
        // Packet size 15 leaves 1 byte of pad, less than a packet
        // header; padding extends through the next block.
        let (mut send, mut recv) = channels();
        let key = SessionKey::generate();
        send.activate_encryption(&key);
        recv.activate_decryption(&key);

        let packet = data_packet(15 - HEADER_SIZE);
        send.queue(&packet).unwrap();

        let chunk = send.take_flush().unwrap().unwrap();
        assert_eq!(chunk.len(), 2 * BLOCK_SIZE);

        recv.ingest(&chunk).unwrap();
        assert_eq!(recv.next_packet().unwrap().unwrap(), packet);
        assert!(recv.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_dribbled_ciphertext_reassembles() {
        let (mut send, mut recv) = channels();
        let key = SessionKey::generate();
        send.activate_encryption(&key);
        recv.activate_decryption(&key);

        let packets = vec![data_packet(40), data_packet(7), data_packet(200)];
        for p in &packets {
            send.queue(p).unwrap();
        }
        let chunk = send.take_flush().unwrap().unwrap();

        // Feed the ciphertext five bytes at a time.
        let mut received = Vec::new();
        for piece in chunk.chunks(5) {
            recv.ingest(piece).unwrap();
            while let Some(packet) = recv.next_packet().unwrap() {
                received.push(packet);
            }
        }
        assert_eq!(received, packets);
    }

    #[test]
    fn test_send_buffer_full_is_explicit() {
        let mut send = SendChannel::new(64, 64);
        assert!(send.queue(&data_packet(32)).is_ok());
        assert!(matches!(
            send.queue(&data_packet(32)),
            Err(CoreError::SendBufferFull { .. })
        ));
    }

    #[test]
    fn test_encrypt_buffer_full_fails_flush_not_submission() {
        let mut send = SendChannel::new(1024, 32);
        let key = SessionKey::generate();
        send.activate_encryption(&key);

        // Submission of an urgent packet succeeds even though the
        // encrypt buffer cannot hold the staged bytes...
        send.queue(&data_packet(100)).unwrap();
        send.queue(&data_packet(1)).unwrap();

        // ...and the overflow surfaces at flush time.
        assert!(matches!(
            send.take_flush(),
            Err(CoreError::EncryptBufferFull { .. })
        ));
    }

    #[test]
    fn test_mid_stream_encryption_activation() {
        let (mut send, mut recv) = channels();
        let key = SessionKey::generate();

        // Plaintext phase.
        let hello = data_packet(20);
        send.queue(&hello).unwrap();
        send.queue(&Packet::new(PacketKind::EncryptionStart, Vec::new()))
            .unwrap();
        let plain_chunk = send.take_flush().unwrap().unwrap();
        send.activate_encryption(&key);

        // Encrypted phase.
        let secret = data_packet(50);
        send.queue(&secret).unwrap();
        let cipher_chunk = send.take_flush().unwrap().unwrap();

        // Receiver sees both phases in one contiguous byte stream.
        recv.ingest(&plain_chunk).unwrap();
        recv.ingest(&cipher_chunk).unwrap();

        assert_eq!(recv.next_packet().unwrap().unwrap(), hello);
        let marker = recv.next_packet().unwrap().unwrap();
        assert_eq!(marker.kind, PacketKind::EncryptionStart);
        recv.activate_decryption(&key);

        assert_eq!(recv.next_packet().unwrap().unwrap(), secret);
    }

    #[test]
    fn test_recv_overflow_rejected() {
        let mut recv = RecvChannel::new(16);
        assert!(recv.ingest(&[0u8; 16]).is_ok());
        assert!(matches!(
            recv.ingest(&[0u8; 1]),
            Err(CoreError::RecvBufferFull)
        ));
    }

    #[test]
    fn test_malformed_frame_is_fatal() {
        let mut recv = RecvChannel::new(1024);
        recv.ingest(&[0xFE, 0x00, 0x01, 0xAA]).unwrap();
        assert!(matches!(
            recv.next_packet(),
            Err(CoreError::MalformedFrame(_))
        ));
    }
}
