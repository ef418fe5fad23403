// Modbus PDU
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use nom::Parser;
use nom::branch::alt;
use nom::combinator::{eof, map, verify};
use nom::multi::length_data;
use nom::number::complete::{be_u8, be_u16};
use std::fmt;

/// 0x03 保持レジスタ読み出し
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// 例外応答フラグ
pub const EXCEPTION_FLAG: u8 = 0x80;

/// 一度に読み出せるレジスタ数の上限
pub const MAX_READ_QUANTITY: u16 = 125;

/// 例外コード
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
}

impl ExceptionCode {
    pub fn code(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
        }
    }
}

/// 要求
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Request {
    ReadHoldingRegisters { address: u16, quantity: u16 },
    Unsupported { function: u8 },
}

impl Request {
    pub fn to_pdu(&self) -> Vec<u8> {
        match self {
            Self::ReadHoldingRegisters { address, quantity } => {
                let mut pdu = vec![READ_HOLDING_REGISTERS];
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                pdu
            }
            Self::Unsupported { function } => vec![*function],
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ReadHoldingRegisters { address, quantity } => {
                write!(f, "ReadHoldingRegisters addr={} n={}", address, quantity)
            }
            Self::Unsupported { function } => write!(f, "Unsupported function=0x{:02X}", function),
        }
    }
}

/// 応答
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Response {
    ReadHoldingRegisters(Vec<u8>),
    Exception { function: u8, code: u8 },
}

impl Response {
    pub fn exception(function: u8, code: ExceptionCode) -> Self {
        Self::Exception {
            function,
            code: code.code(),
        }
    }

    pub fn to_pdu(&self) -> Vec<u8> {
        match self {
            Self::ReadHoldingRegisters(data) => {
                let mut pdu = vec![READ_HOLDING_REGISTERS, data.len() as u8];
                pdu.extend_from_slice(data);
                pdu
            }
            Self::Exception { function, code } => vec![function | EXCEPTION_FLAG, *code],
        }
    }
}

// 03 AAAA NNNN
fn rx_read_holding_registers_request(input: &[u8]) -> nom::IResult<&[u8], Request> {
    let parser = (
        verify(be_u8, |fc: &u8| *fc == READ_HOLDING_REGISTERS),
        be_u16,
        be_u16,
        eof,
    );
    map(parser, |(_fc, address, quantity, _eof)| {
        Request::ReadHoldingRegisters { address, quantity }
    })
    .parse(input)
}

// 未対応のファンクションコード
fn rx_unsupported_request(input: &[u8]) -> nom::IResult<&[u8], Request> {
    map(
        verify(be_u8, |fc: &u8| *fc != READ_HOLDING_REGISTERS),
        |function| Request::Unsupported { function },
    )
    .parse(input)
}

// 03 LL DATA...
fn rx_read_holding_registers_response(input: &[u8]) -> nom::IResult<&[u8], Response> {
    let parser = (
        verify(be_u8, |fc: &u8| *fc == READ_HOLDING_REGISTERS),
        length_data(be_u8),
        eof,
    );
    map(parser, |(_fc, data, _eof): (u8, &[u8], &[u8])| {
        Response::ReadHoldingRegisters(data.to_vec())
    })
    .parse(input)
}

// 8X CC
fn rx_exception_response(input: &[u8]) -> nom::IResult<&[u8], Response> {
    let parser = (
        verify(be_u8, |fc: &u8| fc & EXCEPTION_FLAG != 0),
        be_u8,
        eof,
    );
    map(parser, |(fc, code, _eof)| Response::Exception {
        function: fc & !EXCEPTION_FLAG,
        code,
    })
    .parse(input)
}

/// 要求を解析する
pub fn parse_request(input: &[u8]) -> nom::IResult<&[u8], Request> {
    alt((rx_read_holding_registers_request, rx_unsupported_request)).parse(input)
}

/// 応答を解析する
pub fn parse_response(input: &[u8]) -> nom::IResult<&[u8], Response> {
    alt((rx_read_holding_registers_response, rx_exception_response)).parse(input)
}

#[test]
fn test1() {
    let request = Request::ReadHoldingRegisters {
        address: 0,
        quantity: 100,
    };
    let pdu = request.to_pdu();
    assert_eq!(pdu, vec![0x03, 0x00, 0x00, 0x00, 0x64]);
    assert_eq!(parse_request(&pdu).unwrap(), (&[][..], request));

    assert_eq!(
        parse_request(&[0x06, 0x00, 0x01, 0x00, 0x02]).unwrap().1,
        Request::Unsupported { function: 0x06 }
    );
    // 後ろに余計なバイトがある読み出し要求
    assert!(parse_request(&[0x03, 0x00, 0x00, 0x00, 0x64, 0xff]).is_err());
    assert!(parse_request(&[]).is_err());
}

#[test]
fn test2() {
    let response = Response::ReadHoldingRegisters(vec![0x43, 0x66, 0x00, 0x00]);
    let pdu = response.to_pdu();
    assert_eq!(pdu, vec![0x03, 0x04, 0x43, 0x66, 0x00, 0x00]);
    assert_eq!(parse_response(&pdu).unwrap().1, response);

    let exception = Response::exception(READ_HOLDING_REGISTERS, ExceptionCode::IllegalDataAddress);
    let pdu = exception.to_pdu();
    assert_eq!(pdu, vec![0x83, 0x02]);
    assert_eq!(
        parse_response(&pdu).unwrap().1,
        Response::Exception {
            function: 0x03,
            code: 0x02
        }
    );
}

#[test]
fn test3() {
    // バイト数と中身が合わない
    assert!(parse_response(&[0x03, 0x04, 0x43, 0x66]).is_err());
    assert!(parse_response(&[0x03, 0x02, 0x43, 0x66, 0x00]).is_err());
    // 知らないファンクションコード
    assert!(parse_response(&[0x04, 0x02, 0x00, 0x00]).is_err());
    // 空
    assert!(parse_response(&[]).is_err());
}
