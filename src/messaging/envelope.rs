use arrayref::array_ref;
use byteorder::{ByteOrder, LittleEndian};

use crate::{
    collection::{CollectionProxy, Index},
    registry::HandlerId,
    termination::epoch::EpochId,
    Error, NodeId,
};

/// Identifies a registered node subset for group broadcasts.
pub type GroupId = u64;

/// Envelope flag byte. The top four bits are flags, the low two bits say
/// what kind of [`Target`] follows the fixed header.
///
/// - `broadcast`: forwarded down a spanning tree rooted at the sender
/// - `term_exempt`: never counted by termination detection
/// - `forwarded`: re-sent by a node that no longer holds the target element
/// - `group`: a group id follows the fixed header
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    const BROADCAST: u8 = 0b1000_0000;
    const TERM_EXEMPT: u8 = 0b0100_0000;
    const FORWARDED: u8 = 0b0010_0000;
    const GROUP: u8 = 0b0001_0000;
    const TARGET_MASK: u8 = 0b0000_0011;

    pub fn broadcast(&self) -> bool {
        self.0 & Self::BROADCAST != 0
    }

    pub fn term_exempt(&self) -> bool {
        self.0 & Self::TERM_EXEMPT != 0
    }

    pub fn forwarded(&self) -> bool {
        self.0 & Self::FORWARDED != 0
    }

    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn set_broadcast(&mut self, on: bool) {
        self.set(Self::BROADCAST, on)
    }

    pub fn set_term_exempt(&mut self, on: bool) {
        self.set(Self::TERM_EXEMPT, on)
    }

    pub fn set_forwarded(&mut self, on: bool) {
        self.set(Self::FORWARDED, on)
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08b}", self.0)
    }
}

/// Where a message is delivered once it reaches a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A free function or functor.
    Node,
    /// One collection element, wherever it currently lives.
    Element { proxy: CollectionProxy, index: Index },
    /// Every local element of a collection (with `broadcast`, every element).
    Collection(CollectionProxy),
    /// The local instance of an object group.
    ObjGroup(u64),
}

impl Target {
    fn tag(&self) -> u8 {
        match self {
            Target::Node => 0,
            Target::Element { .. } => 1,
            Target::Collection(_) => 2,
            Target::ObjGroup(_) => 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub handler: HandlerId,
    /// The node that created the message; the broadcast root for broadcasts.
    pub from: NodeId,
    pub epoch: EpochId,
    pub group: Option<GroupId>,
    pub target: Target,
    /// How many times the message chased a migrated element.
    pub hops: u8,
    pub flags: Flags,
}

impl Envelope {
    pub fn new(handler: HandlerId, from: NodeId, epoch: EpochId, target: Target) -> Self {
        Self {
            handler,
            from,
            epoch,
            group: None,
            target,
            hops: 0,
            flags: Flags::default(),
        }
    }
}

/// A message as it sits in the scheduler queue. Shared behind an `Arc` so a
/// broadcast hands the same allocation to every tree child and the local
/// handler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub env: Envelope,
    pub payload: Vec<u8>,
}

// flags | handler | from | epoch | hops
const HEADER_LEN: usize = 1 + 8 + 4 + 8 + 1;

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        let env = &self.env;
        let mut flags = env.flags.0 & !(Flags::GROUP | Flags::TARGET_MASK);
        if env.group.is_some() {
            flags |= Flags::GROUP;
        }
        flags |= env.target.tag();

        let mut header = [0u8; HEADER_LEN];
        header[0] = flags;
        LittleEndian::write_u64(&mut header[1..9], env.handler.raw());
        LittleEndian::write_u32(&mut header[9..13], env.from);
        LittleEndian::write_u64(&mut header[13..21], env.epoch.raw());
        header[21] = env.hops;

        let mut buf = Vec::with_capacity(HEADER_LEN + 32 + self.payload.len());
        buf.extend_from_slice(&header);
        if let Some(group) = env.group {
            buf.extend_from_slice(&group.to_le_bytes());
        }
        match &env.target {
            Target::Node => {}
            Target::Element { proxy, index } => {
                buf.extend_from_slice(&proxy.raw().to_le_bytes());
                buf.push(index.dims() as u8);
                let mut varint = unsigned_varint::encode::u64_buffer();
                for coord in index.coords() {
                    buf.extend_from_slice(unsigned_varint::encode::u64(*coord, &mut varint));
                }
            }
            Target::Collection(proxy) => buf.extend_from_slice(&proxy.raw().to_le_bytes()),
            Target::ObjGroup(id) => buf.extend_from_slice(&id.to_le_bytes()),
        }
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_LEN {
            Err(Error::MalformedEnvelope("truncated header"))?
        }
        let header = array_ref![bytes, 0, HEADER_LEN];
        let flag_byte = header[0];
        let mut rest = &bytes[HEADER_LEN..];

        let group = if flag_byte & Flags::GROUP != 0 {
            Some(take_u64(&mut rest)?)
        } else {
            None
        };
        let target = match flag_byte & Flags::TARGET_MASK {
            0 => Target::Node,
            1 => {
                let proxy = CollectionProxy::from_raw(take_u64(&mut rest)?);
                let (&dims, tail) = rest
                    .split_first()
                    .ok_or(Error::MalformedEnvelope("missing index"))?;
                rest = tail;
                let mut coords = [0u64; 3];
                if dims as usize > coords.len() {
                    Err(Error::MalformedEnvelope("index has too many dimensions"))?
                }
                for coord in coords.iter_mut().take(dims as usize) {
                    let (value, tail) = unsigned_varint::decode::u64(rest)?;
                    *coord = value;
                    rest = tail;
                }
                let index = Index::from_coords(&coords[..dims as usize])
                    .ok_or(Error::MalformedEnvelope("empty index"))?;
                Target::Element { proxy, index }
            }
            2 => Target::Collection(CollectionProxy::from_raw(take_u64(&mut rest)?)),
            _ => Target::ObjGroup(take_u64(&mut rest)?),
        };

        let env = Envelope {
            handler: HandlerId::from_raw(LittleEndian::read_u64(&header[1..9])),
            from: LittleEndian::read_u32(&header[9..13]),
            epoch: EpochId::from_raw(LittleEndian::read_u64(&header[13..21])),
            group,
            target,
            hops: header[21],
            flags: Flags(flag_byte & !(Flags::GROUP | Flags::TARGET_MASK)),
        };
        Ok(Message {
            env,
            payload: rest.to_vec(),
        })
    }
}

fn take_u64(rest: &mut &[u8]) -> Result<u64, Error> {
    if rest.len() < 8 {
        Err(Error::MalformedEnvelope("truncated field"))?
    }
    let value = LittleEndian::read_u64(&rest[..8]);
    *rest = &rest[8..];
    Ok(value)
}
