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

//! A line-oriented echo server built on `colossus`. Every request is a
//! single `<body>\n` line; the response is the same line, echoed back.
//!
//! Run with a worker per core, listening on 127.0.0.1:8080:
//!
//! ```text
//! cargo run --example example_server
//! ```

use std::io;

use colossus::buffer::DataBuffer;
use colossus::callback::Callback;
use colossus::config::Config;
use colossus::context::Context;
use colossus::encoder::{BlockEncoder, BoxedEncoder};
use colossus::error::ColossusError;
use colossus::iosystem::IOSystem;
use colossus::service::{Codec, DecodeOutcome, Handler, ServiceInitializer};

#[derive(Default)]
struct LineCodec;

impl Codec for LineCodec {
    type Input = Vec<u8>;
    type Output = Vec<u8>;

    fn decode(&mut self, buf: &mut DataBuffer<'_>) -> Result<DecodeOutcome<Vec<u8>>, ColossusError> {
        match buf.as_slice().iter().position(|&b| b == b'\n') {
            Some(idx) => {
                let line = buf.as_slice()[..idx].to_vec();
                buf.advance(idx + 1);
                Ok(DecodeOutcome::Frame(line))
            }
            None => Ok(DecodeOutcome::More),
        }
    }

    fn encode(output: Vec<u8>) -> BoxedEncoder {
        let mut framed = output;
        framed.push(b'\n');
        Box::new(BlockEncoder::new(framed))
    }

    fn error_response(cause: &ColossusError) -> Option<Vec<u8>> {
        Some(format!("ERR {cause}").into_bytes())
    }
}

struct EchoHandler;

impl Handler<LineCodec> for EchoHandler {
    fn receive(&mut self, _ctx: &Context, input: Vec<u8>) -> Callback<Vec<u8>> {
        Callback::successful(input)
    }
}

fn main() -> io::Result<()> {
    let config = Config::default();
    let system = IOSystem::<mio::net::TcpStream>::new("echo", config.clone())
        .expect("worker pool failed to start");

    let addr = "127.0.0.1:8080".parse().unwrap();
    let server = system
        .bind_server::<mio::net::TcpListener, _, _>("echo", addr, || {
            ServiceInitializer::new(&config, LineCodec::default, || EchoHandler)
        })
        .expect("failed to bind listener");

    println!("echo server listening on {}", server.local_addr());
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
    }
}
