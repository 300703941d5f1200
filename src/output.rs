use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct OutputKey {
    pub(crate) adapter_luid: u64,
    pub(crate) output_id: u64,
}

impl OutputKey {
    pub(crate) fn from_device_name(adapter_luid: u64, device_name: &str) -> Self {
        Self {
            adapter_luid,
            output_id: fnv1a_64(device_name.as_bytes()),
        }
    }
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0001_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// A display output as seen by the capture platform: the graphics
/// adapter driving it and its position in that adapter's output list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputId {
    key: OutputKey,

    adapter_index: u32,

    output_index: u32,

    name: String,

    is_primary: bool,
}

impl OutputId {
    pub fn new(
        adapter_index: u32,
        output_index: u32,
        adapter_luid: u64,
        name: impl Into<String>,
        is_primary: bool,
    ) -> Self {
        let name = name.into();
        Self {
            key: OutputKey::from_device_name(adapter_luid, &name),
            adapter_index,
            output_index,
            name,
            is_primary,
        }
    }

    pub fn adapter_index(&self) -> u32 {
        self.adapter_index
    }

    pub fn output_index(&self) -> u32 {
        self.output_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// Identifier that survives re-enumeration as long as the adapter and
    /// the output's device name stay the same.
    pub fn stable_id(&self) -> String {
        format!("{:016x}-{:016x}", self.key.adapter_luid, self.key.output_id)
    }

    pub(crate) fn key(&self) -> OutputKey {
        self.key
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
