use std::collections::VecDeque;

/// Default dynamic table capacity, per RFC 7541.
const DEFAULT_TABLE_SIZE: usize = 4096;

/// Per-entry overhead counted against the dynamic table size.
const ENTRY_OVERHEAD: usize = 32;

/// RFC 7541 Appendix A.
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Header-block decode failure; maps to COMPRESSION_ERROR on the
/// connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HpackError;

/// Encode an HPACK integer with the given prefix width into `out`, merging
/// the high bits of the first octet.
fn encode_integer(out: &mut Vec<u8>, high_bits: u8, prefix_bits: u8, mut value: usize) {
    let max_prefix = (1usize << prefix_bits) - 1;

    if value < max_prefix {
        out.push(high_bits | value as u8);
        return;
    }

    out.push(high_bits | max_prefix as u8);
    value -= max_prefix;

    while value >= 128 {
        out.push((value % 128) as u8 | 0x80);
        value /= 128;
    }

    out.push(value as u8);
}

fn decode_integer(block: &[u8], cursor: &mut usize, prefix_bits: u8) -> Result<usize, HpackError> {
    let max_prefix = (1usize << prefix_bits) - 1;

    let first = *block.get(*cursor).ok_or(HpackError)?;
    *cursor += 1;

    let mut value = (first as usize) & max_prefix;

    if value < max_prefix {
        return Ok(value);
    }

    let mut shift = 0u32;

    loop {
        let octet = *block.get(*cursor).ok_or(HpackError)?;
        *cursor += 1;

        value = value
            .checked_add(((octet & 0x7F) as usize) << shift)
            .ok_or(HpackError)?;

        if octet & 0x80 == 0 {
            return Ok(value);
        }

        shift += 7;

        if shift > 28 {
            return Err(HpackError);
        }
    }
}

fn encode_string(out: &mut Vec<u8>, value: &str) {
    // Huffman bit clear: this encoder always emits literal octets.
    encode_integer(out, 0x00, 7, value.len());
    out.extend_from_slice(value.as_bytes());
}

fn decode_string(block: &[u8], cursor: &mut usize) -> Result<String, HpackError> {
    let huffman = *block.get(*cursor).ok_or(HpackError)? & 0x80 != 0;
    let length = decode_integer(block, cursor, 7)?;

    // Huffman-coded fields are not accepted; see the connection error
    // mapping.
    if huffman {
        return Err(HpackError);
    }

    let end = cursor.checked_add(length).ok_or(HpackError)?;
    let raw = block.get(*cursor..end).ok_or(HpackError)?;
    *cursor = end;

    String::from_utf8(raw.to_vec()).map_err(|_| HpackError)
}

/// Stateless header-block encoder: exact static-table matches become
/// indexed fields, everything else a literal without indexing. Never
/// populates the peer's dynamic table, so encoding is safe to interleave
/// across streams.
pub fn encode(headers: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();

    for (name, value) in headers {
        let mut name_index = None;

        let mut matched = false;

        for (index, (static_name, static_value)) in STATIC_TABLE.iter().enumerate() {
            if *static_name == name.as_str() {
                if name_index.is_none() {
                    name_index = Some(index + 1);
                }

                if *static_value == value.as_str() {
                    // Indexed header field.
                    encode_integer(&mut out, 0x80, 7, index + 1);
                    matched = true;
                    break;
                }
            }
        }

        if matched {
            continue;
        }

        match name_index {
            // Literal without indexing, indexed name.
            Some(index) => encode_integer(&mut out, 0x00, 4, index),
            // Literal without indexing, new name.
            None => {
                out.push(0x00);
                encode_string(&mut out, name);
            }
        }

        encode_string(&mut out, value);
    }

    out
}

/// Header-block decoder with the dynamic table the peer's encoder may use.
pub struct Decoder {
    dynamic: VecDeque<(String, String)>,
    size: usize,
    max_size: usize,
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            dynamic: VecDeque::new(),
            size: 0,
            max_size: DEFAULT_TABLE_SIZE,
        }
    }

    fn lookup(&self, index: usize) -> Result<(String, String), HpackError> {
        if index == 0 {
            return Err(HpackError);
        }

        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_string(), value.to_string()));
        }

        self.dynamic
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(HpackError)
    }

    fn insert(&mut self, name: String, value: String) {
        let entry_size = name.len() + value.len() + ENTRY_OVERHEAD;

        self.dynamic.push_front((name, value));
        self.size += entry_size;

        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            match self.dynamic.pop_back() {
                Some((name, value)) => {
                    self.size -= name.len() + value.len() + ENTRY_OVERHEAD;
                }
                None => break,
            }
        }
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>, HpackError> {
        let mut headers = Vec::new();
        let mut cursor = 0usize;

        while cursor < block.len() {
            let first = block[cursor];

            if first & 0x80 != 0 {
                // Indexed header field.
                let index = decode_integer(block, &mut cursor, 7)?;
                headers.push(self.lookup(index)?);
            } else if first & 0xC0 == 0x40 {
                // Literal with incremental indexing.
                let index = decode_integer(block, &mut cursor, 6)?;

                let name = match index {
                    0 => decode_string(block, &mut cursor)?,
                    _ => self.lookup(index)?.0,
                };

                let value = decode_string(block, &mut cursor)?;

                self.insert(name.clone(), value.clone());
                headers.push((name, value));
            } else if first & 0xE0 == 0x20 {
                // Dynamic table size update.
                let new_size = decode_integer(block, &mut cursor, 5)?;

                if new_size > DEFAULT_TABLE_SIZE {
                    return Err(HpackError);
                }

                self.max_size = new_size;
                self.evict();
            } else {
                // Literal without indexing (0x00) or never-indexed (0x10).
                let index = decode_integer(block, &mut cursor, 4)?;

                let name = match index {
                    0 => decode_string(block, &mut cursor)?,
                    _ => self.lookup(index)?.0,
                };

                let value = decode_string(block, &mut cursor)?;
                headers.push((name, value));
            }
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn test_roundtrip_request_headers() {
        let headers = pairs(&[
            (":method", "POST"),
            (":path", "/api/v1/echo"),
            (":scheme", "https"),
            (":authority", "router.local"),
            ("content-type", "application/json"),
            ("x-request-id", "abc-123"),
        ]);

        let block = encode(&headers);
        let decoded = Decoder::new().decode(&block).unwrap();

        assert_eq!(decoded, headers);
    }

    #[test]
    fn test_roundtrip_response_headers() {
        let headers = pairs(&[(":status", "503"), ("content-length", "0")]);

        let block = encode(&headers);
        let decoded = Decoder::new().decode(&block).unwrap();

        assert_eq!(decoded, headers);
    }

    #[test]
    fn test_static_exact_match_is_one_octet() {
        let headers = pairs(&[(":method", "GET")]);
        let block = encode(&headers);

        assert_eq!(block, vec![0x82]);
    }

    #[test]
    fn test_decode_incremental_indexing_and_reuse() {
        // Peer inserts a header into the dynamic table, then references it
        // by index.
        let mut block = Vec::new();

        // Literal with incremental indexing, new name.
        block.push(0x40);
        encode_string(&mut block, "x-custom");
        encode_string(&mut block, "one");

        // Indexed reference to dynamic entry 62.
        encode_integer(&mut block, 0x80, 7, 62);

        let decoded = Decoder::new().decode(&block).unwrap();

        assert_eq!(
            decoded,
            pairs(&[("x-custom", "one"), ("x-custom", "one")])
        );
    }

    #[test]
    fn test_dynamic_table_eviction() {
        let mut decoder = Decoder::new();

        // Shrink the table so a single insert evicts the previous one.
        let mut block = Vec::new();
        encode_integer(&mut block, 0x20, 5, 64);
        decoder.decode(&block).unwrap();

        for round in 0..3 {
            let mut block = Vec::new();
            block.push(0x40);
            encode_string(&mut block, "x-k");
            encode_string(&mut block, &format!("value-{}", round));
            decoder.decode(&block).unwrap();
        }

        assert_eq!(decoder.dynamic.len(), 1);
        assert_eq!(decoder.dynamic[0].1, "value-2");
    }

    #[test]
    fn test_huffman_rejected() {
        let mut block = Vec::new();
        block.push(0x00);
        // Huffman bit set on the name string.
        block.push(0x81);
        block.push(0xFF);

        assert_eq!(Decoder::new().decode(&block), Err(HpackError));
    }

    #[test]
    fn test_truncated_block_rejected() {
        let headers = pairs(&[("x-a", "long-enough-value")]);
        let block = encode(&headers);

        assert_eq!(Decoder::new().decode(&block[..block.len() - 2]), Err(HpackError));
    }

    #[test]
    fn test_integer_wide_values() {
        let mut out = Vec::new();
        encode_integer(&mut out, 0x00, 5, 1337);

        let mut cursor = 0;
        assert_eq!(decode_integer(&out, &mut cursor, 5).unwrap(), 1337);
        assert_eq!(cursor, out.len());
    }
}
