//! UDP voice data plane: IP discovery and encrypted packet build/send.

use crate::error::{Error, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use xsalsa20poly1305::aead::{Aead, NewAead};
use xsalsa20poly1305::{Key, Nonce, XSalsa20Poly1305};

const HEADER_LEN: usize = 12;
const NONCE_LEN: usize = 24;
const FRAME_STEP: u32 = 960;
const CADENCE: Duration = Duration::from_millis(20);

/// Three-byte Opus payload signalling silence; emitted five times in a row
/// to tell the server "not speaking" rather than "packet loss".
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// The UDP media plane for one voice-gateway session: IP discovery, an
/// outbound send loop cadenced at 20 ms, and best-effort inbound decode.
///
/// Created on voice-gateway `Ready`; usable for [`write`](Self::write) only
/// once [`install_secret_key`](Self::install_secret_key) has run.
pub struct VoiceConnection {
    socket: Arc<UdpSocket>,
    destination: StdMutex<SocketAddr>,
    ssrc: u32,
    sequence: AtomicU16,
    timestamp: AtomicU32,
    secret_key: StdMutex<Option<[u8; 32]>>,
    paused: AtomicBool,
    outbound: mpsc::Sender<Vec<u8>>,
    close: CancellationToken,
}

impl VoiceConnection {
    /// Resolve `host:port` and open a connected datagram socket, then start
    /// the outbound send loop. Not yet usable for `write` until a secret key
    /// is installed.
    pub async fn dial(host: &str, port: u16, ssrc: u32) -> Result<Arc<VoiceConnection>> {
        let destination = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::HandshakeFailed("failed to resolve voice hostname".into()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(destination).await?;

        let (outbound, receiver) = mpsc::channel(16);
        let conn = Arc::new(VoiceConnection {
            socket: Arc::new(socket),
            destination: StdMutex::new(destination),
            ssrc,
            sequence: AtomicU16::new(0),
            timestamp: AtomicU32::new(0),
            secret_key: StdMutex::new(None),
            paused: AtomicBool::new(false),
            outbound,
            close: CancellationToken::new(),
        });
        conn.clone().spawn_send_loop(receiver);
        Ok(conn)
    }

    /// Discord's IP-discovery exchange: send a 70-byte request carrying
    /// `ssrc`, parse the 70-byte reply for our externally visible address.
    pub async fn discover_ip(&self) -> Result<(String, u16)> {
        let mut request = [0u8; 70];
        BigEndian::write_u16(&mut request[0..2], 0x1);
        BigEndian::write_u16(&mut request[2..4], 70);
        BigEndian::write_u32(&mut request[4..8], self.ssrc);
        self.socket.send(&request).await?;

        let mut reply = [0u8; 70];
        let n = self.socket.recv(&mut reply).await?;
        if n < 70 {
            return Err(Error::IPDiscoveryMalformed);
        }

        let nul = reply[4..68]
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::IPDiscoveryMalformed)?;
        let address = std::str::from_utf8(&reply[4..4 + nul])
            .map_err(|_| Error::IPDiscoveryMalformed)?
            .to_string();
        let port = LittleEndian::read_u16(&reply[68..70]);
        Ok((address, port))
    }

    /// Install the 32-byte secret key delivered by `SessionDescription`.
    /// `write` fails with [`Error::NotReady`] before this has run.
    pub fn install_secret_key(&self, key: [u8; 32]) {
        *self.secret_key.lock().expect("secret key lock poisoned") = Some(key);
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Enqueue one Opus frame for the send loop. Best-effort: if the
    /// outbound queue is full (the loop is running behind), the frame is
    /// dropped rather than retried. While paused, returns without sending.
    pub fn write(&self, payload: Vec<u8>) -> Result<()> {
        if self
            .secret_key
            .lock()
            .expect("secret key lock poisoned")
            .is_none()
        {
            return Err(Error::NotReady);
        }
        if self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.outbound.try_send(payload);
        Ok(())
    }

    /// Emit the five-frame Opus silence signal that tells Discord "not
    /// speaking" rather than leaving the server to infer packet loss.
    pub fn stop_speaking(&self) -> Result<()> {
        for _ in 0..5 {
            self.write(SILENCE_FRAME.to_vec())?;
        }
        Ok(())
    }

    /// Pause the send loop: `write` becomes a no-op and the destination may
    /// be changed with [`redial`](Self::redial) before [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume sending after a pause.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Re-point the connected socket at a new destination, used when a
    /// mid-session reconnect moves the voice server. Intended to be called
    /// while paused.
    pub async fn redial(&self, host: &str, port: u16) -> Result<()> {
        let destination = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::HandshakeFailed("failed to resolve voice hostname".into()))?;
        self.socket.connect(destination).await?;
        *self.destination.lock().expect("destination lock poisoned") = destination;
        Ok(())
    }

    /// Read one inbound datagram and decrypt it; the decoded Opus payload is
    /// returned as-is (decoding it is out of scope for this crate).
    pub async fn read_packet(&self) -> Result<Vec<u8>> {
        let mut buf = [0u8; 1500];
        let n = self.socket.recv(&mut buf).await?;
        if n < HEADER_LEN {
            return Err(Error::EmptyPayload);
        }
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes[..HEADER_LEN].copy_from_slice(&buf[..HEADER_LEN]);
        let key = self
            .secret_key
            .lock()
            .expect("secret key lock poisoned")
            .ok_or(Error::NotReady)?;
        let cipher = XSalsa20Poly1305::new(Key::from_slice(&key));
        let nonce = Nonce::from_slice(&nonce_bytes);
        cipher
            .decrypt(nonce, &buf[HEADER_LEN..n])
            .map_err(|_| Error::HandshakeFailed("voice packet decryption failed".into()))
    }

    /// Stop the send loop and release the socket.
    pub fn close(&self) {
        self.close.cancel();
    }

    fn build_header(&self, sequence: u16, timestamp: u32) -> [u8; HEADER_LEN] {
        encode_header(self.ssrc, sequence, timestamp)
    }

    fn build_frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .secret_key
            .lock()
            .expect("secret key lock poisoned")
            .ok_or(Error::NotReady)?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let timestamp = self.timestamp.fetch_add(FRAME_STEP, Ordering::SeqCst);

        let header = self.build_header(sequence, timestamp);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes[..HEADER_LEN].copy_from_slice(&header);

        let cipher = XSalsa20Poly1305::new(Key::from_slice(&key));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, payload)
            .map_err(|_| Error::HandshakeFailed("voice packet encryption failed".into()))?;

        let mut packet = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&ciphertext);
        Ok(packet)
    }

    fn spawn_send_loop(self: Arc<Self>, mut receiver: mpsc::Receiver<Vec<u8>>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CADENCE);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = self.close.cancelled() => return,
                    _ = ticker.tick() => {
                        if self.paused.load(Ordering::SeqCst) {
                            continue;
                        }
                        if let Ok(payload) = receiver.try_recv() {
                            match self.build_frame(&payload) {
                                Ok(packet) => {
                                    let _ = self.socket.send(&packet).await;
                                }
                                Err(_) => {}
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Pure header-construction function, exercised directly by the literal
/// packet-header test case (spec scenario 4) without requiring a live socket.
fn encode_header(ssrc: u32, sequence: u16, timestamp: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = 0x80;
    header[1] = 0x78;
    BigEndian::write_u16(&mut header[2..4], sequence);
    BigEndian::write_u32(&mut header[4..8], timestamp);
    BigEndian::write_u32(&mut header[8..12], ssrc);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_header_matches_literal_bytes() {
        let header = encode_header(0xDEADBEEF, 1, 960);
        assert_eq!(
            header,
            [0x80, 0x78, 0x00, 0x01, 0x00, 0x00, 0x03, 0xC0, 0xDE, 0xAD, 0xBE, 0xEF]
        );
    }

    #[test]
    fn nonce_is_header_left_padded_with_zeros() {
        let header = encode_header(42, 0, 0);
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..HEADER_LEN].copy_from_slice(&header);
        assert_eq!(&nonce[HEADER_LEN..], &[0u8; 12]);
        assert_eq!(&nonce[..HEADER_LEN], &header);
    }

    #[tokio::test]
    async fn write_before_secret_key_fails_not_ready() {
        let conn = VoiceConnection::dial("127.0.0.1", 9999, 42).await.unwrap();
        assert!(matches!(conn.write(vec![1, 2, 3]), Err(Error::NotReady)));
    }

    #[tokio::test]
    async fn sequence_and_timestamp_advance_per_frame() {
        let conn = VoiceConnection::dial("127.0.0.1", 9999, 42).await.unwrap();
        conn.install_secret_key([0xAA; 32]);

        let first = conn.build_frame(&[1, 2]).unwrap();
        let second = conn.build_frame(&[1, 2]).unwrap();

        assert_eq!(BigEndian::read_u16(&first[2..4]), 0);
        assert_eq!(BigEndian::read_u32(&first[4..8]), 0);
        assert_eq!(BigEndian::read_u16(&second[2..4]), 1);
        assert_eq!(BigEndian::read_u32(&second[4..8]), 960);
    }
}

