// Modbus/TCP 通信エラー
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(r#"i/o "{0}""#)]
    Io(#[from] io::Error),

    #[error(r#"binary encode "{0}""#)]
    BinaryEncode(#[from] bincode::error::EncodeError),

    #[error(r#"binary decode "{0}""#)]
    BinaryDecode(#[from] bincode::error::DecodeError),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("exception response. function: 0x{function:02X}, code: 0x{code:02X}")]
    Exception { function: u8, code: u8 },

    #[error("response timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,
}
