//! Audio Frame - feste Anzahl Mono-Samples mit Zeitstempel

/// Ein Frame, wie er an den Transport geht.
///
/// Enthält immer genau die konfigurierte Anzahl Samples; der letzte Frame
/// einer endlichen Quelle wird mit Nullen aufgefüllt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channel_count: u16,
    /// Monoton steigend pro Stream
    pub timestamp_millis: u64,
}

impl AudioFrame {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples als big-endian Bytes (Netzwerk-Byte-Order, z.B. für L16)
    pub fn to_be_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_be_bytes()).collect()
    }
}
