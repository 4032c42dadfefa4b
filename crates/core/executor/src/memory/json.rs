use std::io::{Read, Write};

use base64::{engine::general_purpose, Engine as _};
use libflate::zlib::{Decoder, Encoder};
use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serialize, Serializer};

use cannon_primitives::consts::PAGE_SIZE;

/// A page as it appears in the legacy JSON state: the page index and the base64 encoding of the
/// zlib-compressed page bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JsonPage {
    pub index: u64,
    #[serde(deserialize_with = "from_base64", serialize_with = "to_base64")]
    pub data: Vec<u8>,
}

fn from_base64<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    let compressed = general_purpose::STANDARD.decode(s).map_err(D::Error::custom)?;
    let mut decoder = Decoder::new(&compressed[..]).map_err(D::Error::custom)?;
    let mut data = Vec::with_capacity(PAGE_SIZE);
    decoder.read_to_end(&mut data).map_err(D::Error::custom)?;
    if data.len() != PAGE_SIZE {
        return Err(D::Error::custom(format!("page has {} bytes, expected {PAGE_SIZE}", data.len())));
    }
    Ok(data)
}

fn to_base64<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut encoder = Encoder::new(Vec::new()).map_err(S::Error::custom)?;
    encoder.write_all(data).map_err(S::Error::custom)?;
    let compressed = encoder.finish().into_result().map_err(S::Error::custom)?;
    serializer.serialize_str(&general_purpose::STANDARD.encode(compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::Memory, Arch};

    #[test]
    fn json_page_round_trip() {
        let mut data = vec![0u8; PAGE_SIZE];
        data[10] = 0x42;
        let page = JsonPage { index: 3, data };
        let json = serde_json::to_string(&page).unwrap();
        assert!(json.starts_with("{\"index\":3,\"data\":\""));
        let decoded: JsonPage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn rejects_short_page() {
        let mut encoder = Encoder::new(Vec::new()).unwrap();
        encoder.write_all(&[1, 2, 3]).unwrap();
        let compressed = encoder.finish().into_result().unwrap();
        let json =
            format!("{{\"index\":0,\"data\":\"{}\"}}", general_purpose::STANDARD.encode(compressed));
        assert!(serde_json::from_str::<JsonPage>(&json).is_err());
    }

    #[test]
    fn memory_through_json_pages() {
        let mut memory: Memory = Memory::new(Arch::Mips32);
        memory.set_word(0x3000, 0xabcd).unwrap();
        memory.set_word(0x1000, 0x1234).unwrap();
        let pages = memory.to_json_pages();
        assert_eq!(pages.iter().map(|p| p.index).collect::<Vec<_>>(), vec![1, 3]);
        let mut restored: Memory = Memory::from_json_pages(Arch::Mips32, pages).unwrap();
        assert_eq!(restored.get_word(0x3000).unwrap(), 0xabcd);
        assert_eq!(restored.merkle_root(), memory.merkle_root());
    }
}
