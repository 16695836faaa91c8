// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::Write;

use duplex_rpc::cfg::config::{ClientConfig, ServerConfig};

fn write_temp(contents: &str) -> tempfile_path::TempFile {
    tempfile_path::TempFile::new(contents)
}

/// A tiny scratch-file helper; the teacher's own config tests parse YAML
/// directly from a string, but load_from_file needs a real path.
mod tempfile_path {
    use std::path::PathBuf;

    pub struct TempFile {
        pub path: PathBuf,
    }

    impl TempFile {
        pub fn new(contents: &str) -> Self {
            let mut path = std::env::temp_dir();
            path.push(format!("duplex-rpc-test-{}.yaml", std::process::id()));
            std::fs::write(&path, contents).expect("write temp config");
            Self { path }
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn server_yaml() -> &'static str {
    r#"
network:
  Address: "127.0.0.1:17890"
concurrency:
  NumOfThreads: 2
  NumOfChannels: 8
  QueueCapacity: 64
timeouts:
  ReadTimeout: 20
  WriteTimeout: 20
  Heartbeat: 5
  HeartbeatTimeout: 15
limits:
  TransportLimit: 65536
  MaxCallDepth: 8
MaxNodeDepth: 8
Debug: false
"#
}

fn client_yaml() -> &'static str {
    r#"
network:
  Address: "127.0.0.1:17890"
buffers:
  ReadBufferSize: 4096
  WriteBufferSize: 4096
timeouts:
  ReadTimeout: 20
  WriteTimeout: 20
  Heartbeat: 5
  HeartbeatTimeout: 15
limits:
  TransportLimit: 65536
  MaxCallDepth: 8
Debug: false
"#
}

#[test]
fn loads_and_validates_server_config_from_disk() {
    let file = write_temp(server_yaml());
    let cfg = ServerConfig::load_from_file(&file.path).expect("load server config");
    assert_eq!(cfg.concurrency.num_of_threads, 2);
    assert_eq!(cfg.limits.max_call_depth, 8);
}

#[test]
fn loads_and_validates_client_config_from_disk() {
    let file = write_temp(client_yaml());
    let cfg = ClientConfig::load_from_file(&file.path).expect("load client config");
    assert_eq!(cfg.buffers.read_buffer_size, 4096);
}
