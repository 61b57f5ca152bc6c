use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::frame::{Channel, FrameHeader, HEADER_LEN};
use crate::transport::DirectionCipher;
use crate::{FRAME_VERSION, KEY_LEN, PROTOCOL_NAME, REKEY_AFTER_MESSAGES, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The paired client; it already knows the instance's static public key.
    Initiator,
    /// The instance; it terminates the session behind the relay.
    Responder,
}

/// A static X25519 keypair usable as a session identity.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NoiseKeypair {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

pub fn generate_keypair() -> Result<NoiseKeypair, SessionError> {
    let keypair = snow::Builder::new(params())
        .generate_keypair()
        .map_err(|source| SessionError::Handshake { source })?;

    Ok(NoiseKeypair {
        private: keypair.private,
        public: keypair.public,
    })
}

/// One endpoint of a `Noise_IK` session.
///
/// Drive the handshake with [`write_handshake`](Self::write_handshake) /
/// [`read_handshake`](Self::read_handshake); once
/// [`is_transport`](Self::is_transport) reports true, switch to
/// [`encrypt`](Self::encrypt) / [`decrypt`](Self::decrypt).
pub struct NoiseSession {
    role: Role,
    session_id: Uuid,
    instance_id: Uuid,
    state: State,
}

enum State {
    Handshake(Box<snow::HandshakeState>),
    Transport(Transport),
    Closed,
}

struct Transport {
    send: SendDirection,
    recv: RecvDirection,
    handshake_hash: [u8; 32],
}

struct SendDirection {
    cipher: DirectionCipher,
    next_counter: u64,
}

struct RecvDirection {
    cipher: DirectionCipher,
    last_seen: Option<u64>,
}

impl NoiseSession {
    /// Client side; `remote_public_key` was delivered by the claim redeem.
    pub fn initiator(
        session_id: Uuid,
        instance_id: Uuid,
        local_private_key: &[u8],
        remote_public_key: &[u8],
    ) -> Result<Self, SessionError> {
        let handshake = snow::Builder::new(params())
            .prologue(&prologue(session_id, instance_id))
            .local_private_key(local_private_key)
            .remote_public_key(remote_public_key)
            .build_initiator()
            .map_err(|source| SessionError::Handshake { source })?;

        Ok(Self {
            role: Role::Initiator,
            session_id,
            instance_id,
            state: State::Handshake(Box::new(handshake)),
        })
    }

    /// Instance side; holds the long-term static key advertised at registration.
    pub fn responder(
        session_id: Uuid,
        instance_id: Uuid,
        local_private_key: &[u8],
    ) -> Result<Self, SessionError> {
        let handshake = snow::Builder::new(params())
            .prologue(&prologue(session_id, instance_id))
            .local_private_key(local_private_key)
            .build_responder()
            .map_err(|source| SessionError::Handshake { source })?;

        Ok(Self {
            role: Role::Responder,
            session_id,
            instance_id,
            state: State::Handshake(Box::new(handshake)),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn is_transport(&self) -> bool {
        matches!(self.state, State::Transport(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Hash of the completed handshake transcript, for channel binding.
    pub fn handshake_hash(&self) -> Option<[u8; 32]> {
        match &self.state {
            State::Transport(transport) => Some(transport.handshake_hash),
            _ => None,
        }
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    /// Produces the next handshake message, carrying `payload`.
    pub fn write_handshake(&mut self, payload: &[u8]) -> Result<Vec<u8>, SessionError> {
        let State::Handshake(handshake) = &mut self.state else {
            return Err(self.not_in_handshake());
        };

        let mut message = vec![0u8; payload.len() + 128];
        let written = match handshake.write_message(payload, &mut message) {
            Ok(written) => written,
            Err(source) => {
                self.state = State::Closed;
                return Err(SessionError::Handshake { source });
            }
        };
        message.truncate(written);

        self.promote_if_finished();

        Ok(message)
    }

    /// Consumes the peer's handshake message and returns its payload.
    ///
    /// A failure here is fatal: IK offers no way to retry a broken
    /// handshake, so the session transitions to closed.
    pub fn read_handshake(&mut self, message: &[u8]) -> Result<Vec<u8>, SessionError> {
        let State::Handshake(handshake) = &mut self.state else {
            return Err(self.not_in_handshake());
        };

        let mut payload = vec![0u8; message.len()];
        let read = match handshake.read_message(message, &mut payload) {
            Ok(read) => read,
            Err(source) => {
                self.state = State::Closed;
                return Err(SessionError::Handshake { source });
            }
        };
        payload.truncate(read);

        self.promote_if_finished();

        Ok(payload)
    }

    /// Seals `plaintext` into a transport frame on the given channel.
    pub fn encrypt(&mut self, channel: Channel, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let transport = self.transport_mut()?;

        if transport.send.next_counter == REKEY_AFTER_MESSAGES {
            transport.send.cipher.rekey();
            transport.send.next_counter = 0;
        }

        let header = FrameHeader::new(channel, transport.send.next_counter);
        let aad = header.to_bytes();
        let ciphertext = transport.send.cipher.seal(header.counter, &aad, plaintext)?;
        transport.send.next_counter += 1;

        let mut frame = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        frame.extend_from_slice(&aad);
        frame.extend_from_slice(&ciphertext);

        Ok(frame)
    }

    /// Opens a transport frame.
    ///
    /// A bad header or a failed decryption discards the frame and leaves the
    /// session usable; a replayed counter closes it.
    pub fn decrypt(&mut self, frame: &[u8]) -> Result<(Channel, Vec<u8>), SessionError> {
        let header = FrameHeader::parse(frame)?;

        let transport = self.transport_mut()?;

        if let Some(last_seen) = transport.recv.last_seen {
            if header.counter <= last_seen {
                self.state = State::Closed;
                return Err(SessionError::ReplayDetected {
                    counter: header.counter,
                    last_seen,
                });
            }
        }

        let plaintext = transport
            .recv
            .cipher
            .open(header.counter, &frame[..HEADER_LEN], &frame[HEADER_LEN..])?;

        transport.recv.last_seen = Some(header.counter);

        // Mirror the sender's rekey threshold: the frame after this one is
        // counter 0 under the next key.
        if header.counter == REKEY_AFTER_MESSAGES - 1 {
            transport.recv.cipher.rekey();
            transport.recv.last_seen = None;
        }

        Ok((header.channel, plaintext))
    }

    fn promote_if_finished(&mut self) {
        let State::Handshake(handshake) = &mut self.state else {
            return;
        };

        if !handshake.is_handshake_finished() {
            return;
        }

        let mut handshake_hash = [0u8; 32];
        handshake_hash.copy_from_slice(handshake.get_handshake_hash());

        // Noise `Split()` yields (initiator→responder, responder→initiator).
        let (initiator_key, responder_key) = handshake.dangerously_get_raw_split();
        let (send_key, recv_key) = match self.role {
            Role::Initiator => (initiator_key, responder_key),
            Role::Responder => (responder_key, initiator_key),
        };

        self.state = State::Transport(Transport {
            send: SendDirection {
                cipher: DirectionCipher::new(send_key),
                next_counter: 0,
            },
            recv: RecvDirection {
                cipher: DirectionCipher::new(recv_key),
                last_seen: None,
            },
            handshake_hash,
        });
    }

    fn transport_mut(&mut self) -> Result<&mut Transport, SessionError> {
        match &mut self.state {
            State::Transport(transport) => Ok(transport),
            State::Closed => Err(SessionError::Closed),
            State::Handshake(_) => Err(SessionError::WrongState { expected: "transport" }),
        }
    }

    fn not_in_handshake(&self) -> SessionError {
        match self.state {
            State::Closed => SessionError::Closed,
            _ => SessionError::WrongState { expected: "handshake" },
        }
    }

    #[cfg(test)]
    fn force_counters(&mut self, send_next: u64, recv_last: Option<u64>) {
        if let State::Transport(transport) = &mut self.state {
            transport.send.next_counter = send_next;
            transport.recv.last_seen = recv_last;
        }
    }
}

fn params() -> snow::params::NoiseParams {
    PROTOCOL_NAME.parse().expect("protocol name is valid")
}

/// Binds the session to the pairing context; a mismatch on either side makes
/// the first handshake message undecryptable.
fn prologue(session_id: Uuid, instance_id: Uuid) -> Vec<u8> {
    let mut prologue = Vec::with_capacity(16 + 16 + 1);
    prologue.extend_from_slice(session_id.as_bytes());
    prologue.extend_from_slice(instance_id.as_bytes());
    prologue.push(FRAME_VERSION);
    prologue
}

// KEY_LEN is what snow's raw split hands back; assert the assumption once.
const _: () = assert!(KEY_LEN == 32);

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (NoiseSession, NoiseSession) {
        let session_id = Uuid::from_u128(1);
        let instance_id = Uuid::from_u128(2);

        let client_key = generate_keypair().unwrap();
        let server_key = generate_keypair().unwrap();

        let mut client =
            NoiseSession::initiator(session_id, instance_id, &client_key.private, &server_key.public).unwrap();
        let mut server = NoiseSession::responder(session_id, instance_id, &server_key.private).unwrap();

        let message_one = client.write_handshake(&[]).unwrap();
        server.read_handshake(&message_one).unwrap();
        let message_two = server.write_handshake(&[]).unwrap();
        client.read_handshake(&message_two).unwrap();

        assert!(client.is_transport());
        assert!(server.is_transport());

        (client, server)
    }

    #[test]
    fn sender_rekeys_at_the_counter_threshold_and_receiver_follows() {
        let (mut client, mut server) = established_pair();

        client.force_counters(REKEY_AFTER_MESSAGES - 1, None);
        server.force_counters(0, Some(REKEY_AFTER_MESSAGES - 2));

        // Last frame under the first key encrypts normally.
        let frame = client.encrypt(Channel::Api, b"last").unwrap();
        assert_eq!(FrameHeader::parse(&frame).unwrap().counter, REKEY_AFTER_MESSAGES - 1);
        assert_eq!(server.decrypt(&frame).unwrap().1, b"last");

        // Crossing the threshold rekeys and restarts the counter at zero.
        let frame = client.encrypt(Channel::Api, b"fresh").unwrap();
        assert_eq!(FrameHeader::parse(&frame).unwrap().counter, 0);
        assert_eq!(server.decrypt(&frame).unwrap().1, b"fresh");
    }

    #[test]
    fn stale_counter_closes_the_session() {
        let (mut client, mut server) = established_pair();

        let first = client.encrypt(Channel::Api, b"one").unwrap();
        let second = client.encrypt(Channel::Api, b"two").unwrap();

        server.decrypt(&second).unwrap();

        assert!(matches!(
            server.decrypt(&first),
            Err(SessionError::ReplayDetected { counter: 0, last_seen: 1 })
        ));
        assert!(server.is_closed());
        assert!(matches!(server.decrypt(&second), Err(SessionError::Closed)));
    }
}
