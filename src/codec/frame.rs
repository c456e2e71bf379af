//! BLE advertising frames that carry an encoded URL.

use super::{decode, encode, CodecError};

pub const MAX_ADVERTISING_BYTES: usize = 31;

pub const EDDYSTONE_SERVICE_UUID: u16 = 0xfeaa;
pub const URIBEACON_SERVICE_UUID: u16 = 0xfed8;

const AD_FLAGS: u8 = 0x01;
const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;

const LE_GENERAL_DISCOVERABLE: u8 = 0x06;
const URL_FRAME_TYPE: u8 = 0x10;
const FAT_BEACON_TITLE_TYPE: u8 = 0x0e;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Eddystone,
    UriBeacon,
}

impl FrameFormat {
    fn service_uuid(self) -> u16 {
        match self {
            FrameFormat::Eddystone => EDDYSTONE_SERVICE_UUID,
            FrameFormat::UriBeacon => URIBEACON_SERVICE_UUID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconFrame {
    Url {
        format: FrameFormat,
        url: String,
        tx_power: i8,
        flags: u8,
    },
    /// Eddystone URL frame carrying a page title instead of a URL. The page
    /// itself is served by the beacon over a connection.
    FatBeacon { title: String, tx_power: i8 },
}

/// One length/type/value structure from a scan record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

/// Splits a scan record into its AD structures. A zero length byte marks
/// the start of padding.
pub fn ad_structures(record: &[u8]) -> Result<Vec<AdStructure<'_>>, CodecError> {
    let mut structures = Vec::new();
    let mut position = 0;
    while position < record.len() {
        let len = record[position] as usize;
        if len == 0 {
            break;
        }
        let end = position + 1 + len;
        let body = record
            .get(position + 1..end)
            .ok_or(CodecError::MalformedFrame)?;
        structures.push(AdStructure {
            ad_type: body[0],
            data: &body[1..],
        });
        position = end;
    }
    Ok(structures)
}

fn advertises_service(structures: &[AdStructure<'_>], uuid: u16) -> bool {
    structures
        .iter()
        .filter(|s| s.ad_type == AD_COMPLETE_UUID16 || s.ad_type == AD_INCOMPLETE_UUID16)
        .flat_map(|s| s.data.chunks_exact(2))
        .any(|pair| u16::from_le_bytes([pair[0], pair[1]]) == uuid)
}

/// Service data for a 16-bit service UUID, without the UUID itself.
pub fn service_data<'a>(structures: &[AdStructure<'a>], uuid: u16) -> Option<&'a [u8]> {
    structures
        .iter()
        .filter(|s| s.ad_type == AD_SERVICE_DATA_UUID16 && s.data.len() >= 2)
        .find(|s| u16::from_le_bytes([s.data[0], s.data[1]]) == uuid)
        .map(|s| &s.data[2..])
}

/// Extracts the URL (or fat beacon title) from a raw scan record.
///
/// Eddystone service data wins over UriBeacon when both are present.
pub fn parse_scan_record(record: &[u8]) -> Result<BeaconFrame, CodecError> {
    let structures = ad_structures(record)?;
    let eddystone = advertises_service(&structures, EDDYSTONE_SERVICE_UUID)
        .then(|| service_data(&structures, EDDYSTONE_SERVICE_UUID))
        .flatten()
        .filter(|data| is_url_frame(data));
    let uribeacon = advertises_service(&structures, URIBEACON_SERVICE_UUID)
        .then(|| service_data(&structures, URIBEACON_SERVICE_UUID))
        .flatten();

    if let Some(data) = eddystone {
        if data.len() > 3 && data[2] == FAT_BEACON_TITLE_TYPE {
            return parse_fat_beacon(data);
        }
        if data.len() > 2 {
            return Ok(BeaconFrame::Url {
                format: FrameFormat::Eddystone,
                url: decode(&data[2..])?,
                tx_power: data[1] as i8,
                flags: data[0] & 0x0f,
            });
        }
    }

    match uribeacon {
        Some(data) if data.len() > 2 => Ok(BeaconFrame::Url {
            format: FrameFormat::UriBeacon,
            url: decode(&data[2..])?,
            tx_power: data[1] as i8,
            flags: data[0],
        }),
        _ => Err(CodecError::NoServiceData),
    }
}

fn is_url_frame(data: &[u8]) -> bool {
    data.first()
        .is_some_and(|&frame| frame & 0xf0 == URL_FRAME_TYPE)
}

fn parse_fat_beacon(data: &[u8]) -> Result<BeaconFrame, CodecError> {
    let title = String::from_utf8_lossy(&data[3..]);
    let title = title.trim();
    if title.is_empty() || title.contains(char::REPLACEMENT_CHARACTER) {
        return Err(CodecError::MalformedFrame);
    }
    Ok(BeaconFrame::FatBeacon {
        title: title.to_string(),
        tx_power: data[1] as i8,
    })
}

/// Builds a complete advertising frame for `url`.
///
/// Layout: flags AD, 16-bit service UUID list, then service data holding the
/// frame header, tx power and the encoded URL.
pub fn build_advertisement(
    format: FrameFormat,
    url: &str,
    tx_power: i8,
) -> Result<Vec<u8>, CodecError> {
    let payload = encode(url)?;
    let uuid = format.service_uuid().to_le_bytes();
    let header = match format {
        FrameFormat::Eddystone => URL_FRAME_TYPE,
        FrameFormat::UriBeacon => 0x00,
    };

    let mut frame = Vec::with_capacity(MAX_ADVERTISING_BYTES);
    frame.extend_from_slice(&[0x02, AD_FLAGS, LE_GENERAL_DISCOVERABLE]);
    frame.extend_from_slice(&[0x03, AD_COMPLETE_UUID16, uuid[0], uuid[1]]);
    // type + uuid + header + tx + payload
    frame.push((1 + 2 + 2 + payload.len()) as u8);
    frame.extend_from_slice(&[AD_SERVICE_DATA_UUID16, uuid[0], uuid[1], header, tx_power as u8]);
    frame.extend_from_slice(&payload);

    if frame.len() > MAX_ADVERTISING_BYTES {
        return Err(CodecError::TooLong {
            len: frame.len(),
            max: MAX_ADVERTISING_BYTES,
        });
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAX_URI_BYTES;

    fn eddystone_record(service_data: &[u8]) -> Vec<u8> {
        let mut record = vec![0x03, 0x03, 0xaa, 0xfe, (service_data.len() + 3) as u8, 0x16, 0xaa, 0xfe];
        record.extend_from_slice(service_data);
        record
    }

    #[test]
    fn parses_eddystone_url_frame() {
        let record = eddystone_record(&[0x10, 0xeb, 0x03, b'g', b'o', b'o', b'.', b'g', b'l', b'/', b'x']);
        let frame = parse_scan_record(&record).unwrap();
        assert_eq!(
            frame,
            BeaconFrame::Url {
                format: FrameFormat::Eddystone,
                url: "https://goo.gl/x".into(),
                tx_power: -21,
                flags: 0,
            }
        );
    }

    #[test]
    fn parses_uribeacon_frame() {
        let record = [
            0x03, 0x03, 0xd8, 0xfe, 0x09, 0x16, 0xd8, 0xfe, 0x00, 0x20, 0x02, b'a', b'b', 0x07,
        ];
        let frame = parse_scan_record(&record).unwrap();
        assert_eq!(
            frame,
            BeaconFrame::Url {
                format: FrameFormat::UriBeacon,
                url: "http://ab.com".into(),
                tx_power: 0x20,
                flags: 0,
            }
        );
    }

    #[test]
    fn parses_fat_beacon_title() {
        let mut data = vec![0x10, 0xf4, 0x0e];
        data.extend_from_slice(b" Coffee menu ");
        let frame = parse_scan_record(&eddystone_record(&data)).unwrap();
        assert_eq!(
            frame,
            BeaconFrame::FatBeacon {
                title: "Coffee menu".into(),
                tx_power: -12,
            }
        );

        let garbled = eddystone_record(&[0x10, 0x00, 0x0e, 0xff, 0xfe]);
        assert_eq!(parse_scan_record(&garbled), Err(CodecError::MalformedFrame));
    }

    #[test]
    fn rejects_records_without_url_service() {
        // Service data present but the UUID is not advertised.
        let record = [0x06, 0x16, 0xaa, 0xfe, 0x10, 0x00, 0x02];
        assert_eq!(parse_scan_record(&record), Err(CodecError::NoServiceData));

        // Eddystone TLM frame (type 0x20) is not a URL frame.
        let tlm = eddystone_record(&[0x20, 0x00, 0x00, 0x00]);
        assert_eq!(parse_scan_record(&tlm), Err(CodecError::NoServiceData));

        // Length byte runs past the end.
        assert_eq!(parse_scan_record(&[0x05, 0x16, 0xaa]), Err(CodecError::MalformedFrame));
    }

    #[test]
    fn built_advertisement_parses_back() {
        for format in [FrameFormat::Eddystone, FrameFormat::UriBeacon] {
            let frame = build_advertisement(format, "https://www.example.com/", -20).unwrap();
            assert!(frame.len() <= MAX_ADVERTISING_BYTES);
            match parse_scan_record(&frame).unwrap() {
                BeaconFrame::Url { url, tx_power, .. } => {
                    assert_eq!(url, "https://www.example.com/");
                    assert_eq!(tx_power, -20);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    #[test]
    fn full_budget_fills_the_frame_exactly() {
        // Scheme byte plus 17 characters.
        let url = "http://abcdefghijklmnopq";
        assert_eq!(encode(url).unwrap().len(), MAX_URI_BYTES);
        let frame = build_advertisement(FrameFormat::Eddystone, url, 0).unwrap();
        assert_eq!(frame.len(), MAX_ADVERTISING_BYTES);
    }
}
