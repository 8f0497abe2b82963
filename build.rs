// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Compiles the detd IPC protocol definition

const PROTO_SRC: &str = "proto/detdipc.proto";

fn main() -> std::io::Result<()> {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path().unwrap());
    }
    prost_build::compile_protos(&[PROTO_SRC], &["proto/"])?;
    println!("cargo:rerun-if-changed={PROTO_SRC}");
    Ok(())
}
