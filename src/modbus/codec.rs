// Modbus/TCP ストリームの区切り
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::modbus::{
    Adu, Error, MAX_PDU_LEN, MBAP_HEADER_LEN, ModbusTcpFrame, PROTOCOL_ID, bincode_config,
};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone, Copy, Debug, Default)]
pub struct ModbusTcpCodec;

impl Decoder for ModbusTcpCodec {
    type Item = Adu;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < MBAP_HEADER_LEN {
            return Ok(None); // ヘッダ待ち
        }
        // 長さフィールド(ユニットID + PDU)
        let length = u16::from_be_bytes([src[4], src[5]]) as usize;
        if length < 2 || length > MAX_PDU_LEN + 1 {
            return Err(Error::Malformed(format!("MBAP length {length}")));
        }
        let total = MBAP_HEADER_LEN - 1 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None); // 続きを待つ
        }
        let raw = src.split_to(total);
        let (frame, _len): (ModbusTcpFrame, usize) =
            bincode::borrow_decode_from_slice(&raw, bincode_config())?;
        if frame.protocol_id != PROTOCOL_ID {
            return Err(Error::Malformed(format!(
                "protocol id {:04X}",
                frame.protocol_id
            )));
        }
        tracing::trace!(target:"<-Rx", "{}", frame);
        Ok(Some(Adu::from(frame)))
    }
}

impl Encoder<Adu> for ModbusTcpCodec {
    type Error = Error;

    fn encode(&mut self, item: Adu, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.pdu.is_empty() || item.pdu.len() > MAX_PDU_LEN {
            return Err(Error::Malformed(format!("PDU length {}", item.pdu.len())));
        }
        let frame = item.as_frame();
        tracing::trace!(target:"Tx->", "{}", frame);
        let encoded = bincode::encode_to_vec(&frame, bincode_config())?;
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

#[test]
fn test1() {
    let mut codec = ModbusTcpCodec;
    let adu = Adu {
        transaction_id: 7,
        unit_id: 1,
        pdu: vec![0x03, 0x04, 0x43, 0x66, 0x00, 0x00],
    };
    let mut buf = BytesMut::new();
    codec.encode(adu.clone(), &mut buf).unwrap();
    codec.encode(adu.clone(), &mut buf).unwrap();
    assert_eq!(buf.len(), 2 * (MBAP_HEADER_LEN + 6));

    // 2フレームを1つずつ取り出す
    let mut partial = buf.split_to(10);
    assert_eq!(codec.decode(&mut partial).unwrap(), None);
    partial.unsplit(buf);
    assert_eq!(codec.decode(&mut partial).unwrap(), Some(adu.clone()));
    assert_eq!(codec.decode(&mut partial).unwrap(), Some(adu));
    assert_eq!(codec.decode(&mut partial).unwrap(), None);
    assert!(partial.is_empty());
}

#[test]
fn test2() {
    let mut codec = ModbusTcpCodec;
    // プロトコル識別子が0でない
    let mut buf = BytesMut::from(&[0x00, 0x01, 0x12, 0x34, 0x00, 0x03, 0x01, 0x83, 0x02][..]);
    assert!(matches!(codec.decode(&mut buf), Err(Error::Malformed(_))));
    // 長さフィールドが短すぎる
    let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01][..]);
    assert!(matches!(codec.decode(&mut buf), Err(Error::Malformed(_))));
    // 空のPDUは送らない
    let empty = Adu {
        transaction_id: 1,
        unit_id: 1,
        pdu: vec![],
    };
    assert!(codec.encode(empty, &mut BytesMut::new()).is_err());
}
