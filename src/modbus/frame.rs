// Modbus/TCP フレーム(MBAPヘッダ + PDU)
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use bincode::de::read::BorrowReader;
use core::result;
use std::fmt;

/// MBAPヘッダ長
pub const MBAP_HEADER_LEN: usize = 7;

/// PDU最大長
pub const MAX_PDU_LEN: usize = 253;

/// Modbusプロトコル識別子
pub const PROTOCOL_ID: u16 = 0;

/// ビッグエンディアン固定長
pub fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// 受信バッファ上のフレーム
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ModbusTcpFrame<'a> {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    pub pdu: &'a [u8],
}

impl<'a> ModbusTcpFrame<'a> {
    /// MBAPヘッダの長さフィールド(ユニットID + PDU)
    pub fn length(&self) -> u16 {
        1 + self.pdu.len() as u16
    }

    pub fn show(&self) -> String {
        format!(
            "TID={:04X} UNIT={} PDU=[{}]",
            self.transaction_id,
            self.unit_id,
            self.pdu
                .iter()
                .map(|n| format!("{:02X}", n))
                .collect::<String>()
        )
    }
}

impl<'de, Context> bincode::BorrowDecode<'de, Context> for ModbusTcpFrame<'de> {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de, Context = Context>>(
        decoder: &mut D,
    ) -> core::result::Result<Self, bincode::error::DecodeError> {
        let transaction_id: u16 = bincode::BorrowDecode::borrow_decode(decoder)?;
        let protocol_id: u16 = bincode::BorrowDecode::borrow_decode(decoder)?;
        let length: u16 = bincode::BorrowDecode::borrow_decode(decoder)?;
        let unit_id: u8 = bincode::BorrowDecode::borrow_decode(decoder)?;
        // 長さフィールドはユニットIDを含む
        let pdu_len = (length as usize)
            .checked_sub(1)
            .ok_or(bincode::error::DecodeError::Other("MBAP length is zero"))?;
        decoder.claim_bytes_read(pdu_len)?;
        let pdu = decoder.borrow_reader().take_bytes(pdu_len)?;
        Ok(Self {
            transaction_id,
            protocol_id,
            unit_id,
            pdu,
        })
    }
}

impl<'a> bincode::Encode for ModbusTcpFrame<'a> {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.transaction_id, encoder)?;
        bincode::Encode::encode(&self.protocol_id, encoder)?;
        bincode::Encode::encode(&self.length(), encoder)?;
        bincode::Encode::encode(&self.unit_id, encoder)?;
        for v in self.pdu {
            bincode::Encode::encode(v, encoder)?;
        }
        Ok(())
    }
}

impl<'a> fmt::Display for ModbusTcpFrame<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.show())
    }
}

/// 所有権を持つフレーム
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Adu {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Vec<u8>,
}

impl Adu {
    pub fn as_frame(&self) -> ModbusTcpFrame<'_> {
        ModbusTcpFrame {
            transaction_id: self.transaction_id,
            protocol_id: PROTOCOL_ID,
            unit_id: self.unit_id,
            pdu: &self.pdu,
        }
    }
}

impl<'a> From<ModbusTcpFrame<'a>> for Adu {
    fn from(frame: ModbusTcpFrame<'a>) -> Self {
        Adu {
            transaction_id: frame.transaction_id,
            unit_id: frame.unit_id,
            pdu: frame.pdu.to_vec(),
        }
    }
}

impl fmt::Display for Adu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_frame().show())
    }
}

#[test]
fn test1() {
    // 保持レジスタ読み出し要求 0番から100レジスタ
    let frame = ModbusTcpFrame {
        transaction_id: 0x1234,
        protocol_id: PROTOCOL_ID,
        unit_id: 1,
        pdu: &[0x03, 0x00, 0x00, 0x00, 0x64],
    };

    let binary: Vec<u8> = vec![
        0x12, 0x34, //
        0x00, 0x00, //
        0x00, 0x06, //
        0x01, //
        0x03, 0x00, 0x00, 0x00, 0x64, //
    ];

    let encoded = bincode::encode_to_vec(&frame, bincode_config()).unwrap();
    assert_eq!(encoded.len(), MBAP_HEADER_LEN + 5);
    assert_eq!(encoded, binary);

    let (decoded, len): (ModbusTcpFrame, usize) =
        bincode::borrow_decode_from_slice(&encoded[..], bincode_config()).unwrap();
    assert_eq!(len, 12);
    assert_eq!(frame, decoded);
    assert_eq!(decoded.to_string(), "TID=1234 UNIT=1 PDU=[0300000064]");
}

#[test]
fn test2() {
    // 長さフィールドが0
    let binary = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01];
    let decoded: Result<(ModbusTcpFrame, usize), _> =
        bincode::borrow_decode_from_slice(&binary[..], bincode_config());
    assert!(decoded.is_err());

    // PDUが足りない
    let binary = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x00];
    let decoded: Result<(ModbusTcpFrame, usize), _> =
        bincode::borrow_decode_from_slice(&binary[..], bincode_config());
    assert!(decoded.is_err());
}
