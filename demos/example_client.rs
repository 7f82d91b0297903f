// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A client for [`example_server`]'s line-oriented echo protocol, built on
//! `colossus`'s reconnecting client support.
//!
//! ```text
//! cargo run --example example_client
//! ```

use std::time::Duration;

use colossus::buffer::DataBuffer;
use colossus::config::Config;
use colossus::encoder::{BlockEncoder, BoxedEncoder};
use colossus::error::ColossusError;
use colossus::iosystem::IOSystem;
use colossus::service::{ClientCodec, DecodeOutcome, ReconnectingClient};

#[derive(Default)]
struct LineClientCodec;

impl ClientCodec for LineClientCodec {
    type Request = Vec<u8>;
    type Response = Vec<u8>;

    fn encode_request(request: Vec<u8>) -> BoxedEncoder {
        let mut framed = request;
        framed.push(b'\n');
        Box::new(BlockEncoder::new(framed))
    }

    fn decode_response(&mut self, buf: &mut DataBuffer<'_>) -> Result<DecodeOutcome<Vec<u8>>, ColossusError> {
        match buf.as_slice().iter().position(|&b| b == b'\n') {
            Some(idx) => {
                let line = buf.as_slice()[..idx].to_vec();
                buf.advance(idx + 1);
                Ok(DecodeOutcome::Frame(line))
            }
            None => Ok(DecodeOutcome::More),
        }
    }
}

fn main() {
    let config = Config::default();
    let system = IOSystem::<mio::net::TcpStream>::new("echo-client", config.clone())
        .expect("worker pool failed to start");

    let addr = "127.0.0.1:8080".parse().unwrap();
    let handle = system.worker_handle(0).expect("at least one worker");
    let client = ReconnectingClient::<LineClientCodec>::connect(&handle, addr, &config);

    let client_ref = loop {
        if let Some(client_ref) = client.current() {
            break client_ref;
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    client_ref.send(b"hello, colossus".to_vec()).execute(|result| match result {
        Ok(echoed) => println!("server said: {}", String::from_utf8_lossy(&echoed)),
        Err(e) => eprintln!("request failed: {e}"),
    });

    std::thread::sleep(Duration::from_millis(100));
    system.shutdown();
}
