//! In-process nameserver that answers signed requests

use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::dnssec::rdata::tsig::{make_tsig_record, message_tbs, TSIG};
use hickory_proto::rr::dnssec::rdata::DNSSECRData;
use hickory_proto::rr::dnssec::tsig::TSigner;
use hickory_proto::rr::{RData, Record};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::tsig::{decode_secret, key_name, parse_algorithm, DEFAULT_FUDGE};

pub const SECRET: &str = "c2VjcmV0LWtleS1mb3ItdGVzdHM=";
pub const KEY_NAME: &str = "update-key";

pub fn server_key() -> TSigner {
    TSigner::new(
        decode_secret(SECRET).unwrap(),
        parse_algorithm("hmac-sha256").unwrap(),
        key_name(KEY_NAME).unwrap(),
        DEFAULT_FUDGE,
    )
    .unwrap()
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// MAC of the request's TSIG record
pub fn request_mac(request: &Message) -> Vec<u8> {
    let record = request.signature().first().expect("request is signed");
    match record.data() {
        Some(RData::DNSSEC(DNSSECRData::TSIG(tsig))) => tsig.mac().to_vec(),
        _ => panic!("request signature is not TSIG"),
    }
}

/// Answer to `request` carrying `answers` and the given RCODE
pub fn answer(request: &Message, answers: Vec<Record>, rcode: ResponseCode) -> Message {
    let mut message = Message::new();
    message
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_response_code(rcode);
    message.add_queries(request.queries().to_vec());
    message.add_answers(answers);
    message
}

/// Sign `message` chained to `prior_mac`, returning wire bytes and the MAC.
///
/// The first message of a response covers the full TSIG variables, later
/// ones only the timers.
pub fn sign_response(
    key: &TSigner,
    mut message: Message,
    prior_mac: &[u8],
    first: bool,
) -> (Vec<u8>, Vec<u8>) {
    let time = now();
    let pre_tsig = TSIG::new(
        key.algorithm().clone(),
        time,
        key.fudge(),
        Vec::new(),
        message.id(),
        0,
        Vec::new(),
    );

    let tbs = if first {
        message_tbs(Some(prior_mac), &message, &pre_tsig, key.signer_name()).unwrap()
    } else {
        let mut tbs = (prior_mac.len() as u16).to_be_bytes().to_vec();
        tbs.extend_from_slice(prior_mac);
        tbs.extend_from_slice(&message.to_vec().unwrap());
        tbs.extend_from_slice(&time.to_be_bytes()[2..]);
        tbs.extend_from_slice(&key.fudge().to_be_bytes());
        tbs
    };
    let mac = key.sign(&tbs).unwrap();

    message.add_tsig(make_tsig_record(
        key.signer_name().clone(),
        pre_tsig.set_mac(mac.clone()),
    ));
    (message.to_vec().unwrap(), mac)
}

/// Answer one UDP request. `respond` maps the request to the raw reply.
pub async fn serve_udp_once<F>(respond: F) -> String
where
    F: FnOnce(&Message) -> Vec<u8> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
        let request = Message::from_vec(&buf[..n]).unwrap();
        socket.send_to(&respond(&request), peer).await.unwrap();
    });

    addr
}

pub async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let len = stream.read_u16().await.unwrap() as usize;
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await.unwrap();
    frame
}

pub async fn write_frame(stream: &mut TcpStream, frame: &[u8]) {
    stream.write_u16(frame.len() as u16).await.unwrap();
    stream.write_all(frame).await.unwrap();
}

/// Accept one TCP connection, read one request, write back every frame
/// `respond` produces for it and close
pub async fn serve_tcp_once<F>(listener: TcpListener, respond: F)
where
    F: FnOnce(&Message) -> Vec<Vec<u8>> + Send + 'static,
{
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = Message::from_vec(&read_frame(&mut stream).await).unwrap();
        for frame in respond(&request) {
            write_frame(&mut stream, &frame).await;
        }
        let _ = stream.shutdown().await;
    });
}
