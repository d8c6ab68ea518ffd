use crate::decode::Value;

/// Serializes a value back to bencode. Dictionary keys are emitted in
/// raw-byte lexicographic order, so any decoded value re-encodes to a byte
/// sequence the decoder accepts again.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(data) => write_bytes(data, out),
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                write_value(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            out.push(b'd');
            // BTreeMap iteration order is the required key order.
            for (key, val) in entries {
                write_bytes(key, out);
                write_value(val, out);
            }
            out.push(b'e');
        }
    }
}

fn write_bytes(data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(data);
}
