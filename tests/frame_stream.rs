use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use image_sender::sources::CountSource;
use image_sender::{
    Controller, Dimensions, GeneratorConfig, PngEncoder, SourceRegistry, TcpFrameTransport,
    ZmqFrameTransport,
};
use zeromq::{Socket, SocketRecv, SubSocket};

const TOPIC: &str = "/frames";

fn read_message(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).expect("read length prefix");
    let mut message = vec![0u8; u32::from_be_bytes(prefix) as usize];
    stream.read_exact(&mut message).expect("read message");
    message
}

fn decode(message: &[u8]) -> image::RgbImage {
    assert!(message.starts_with(TOPIC.as_bytes()), "missing topic prefix");
    image::load_from_memory_with_format(&message[TOPIC.len()..], image::ImageFormat::Png)
        .expect("decode png")
        .to_rgb8()
}

fn count_controller(dimensions: Dimensions) -> Controller {
    let mut registry = SourceRegistry::new();
    registry
        .register(CountSource::new(dimensions))
        .expect("register");
    Controller::new(
        registry,
        GeneratorConfig {
            target_fps: 120,
            ..GeneratorConfig::default()
        },
        Arc::new(PngEncoder),
        TOPIC,
        64,
    )
}

#[test]
fn zmq_subscriber_on_frames_topic_receives_png_frames() {
    let transport = ZmqFrameTransport::bind("127.0.0.1:0").expect("bind");
    let endpoint = transport.endpoint().to_string();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("runtime");
    let mut subscriber = SubSocket::new();
    runtime
        .block_on(async {
            subscriber.connect(&endpoint).await?;
            subscriber.subscribe(TOPIC).await
        })
        .expect("subscribe");

    let mut controller = count_controller(Dimensions::new(32, 32));
    controller
        .start("Count", Box::new(transport))
        .expect("start");

    let frames: Vec<_> = (0..4)
        .map(|_| {
            let message = runtime
                .block_on(async { tokio::time::timeout(Duration::from_secs(5), subscriber.recv()).await })
                .expect("frame within timeout")
                .expect("recv");
            assert_eq!(message.len(), 1, "one zmq frame per message");
            decode(message.get(0).expect("first frame"))
        })
        .collect();
    controller.stop().expect("stop");

    // Frames published before the subscription propagated are lost, so only
    // the rendered content and the size are checked.
    for frame in &frames {
        assert_eq!((frame.width(), frame.height()), (32, 32));
    }
    assert!(frames
        .last()
        .is_some_and(|frame| frame.pixels().any(|p| p.0 != [0, 0, 0])));
}

#[test]
fn subscriber_receives_blank_then_rendered_png_frames() {
    let transport = TcpFrameTransport::bind("127.0.0.1:0").expect("bind");
    let addr = transport.local_addr();
    let mut subscriber = TcpStream::connect(addr).expect("connect");
    subscriber
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");

    let mut controller = count_controller(Dimensions::new(64, 32));
    controller
        .start("Count", Box::new(transport))
        .expect("start");

    let frames: Vec<_> = (0..6)
        .map(|_| decode(&read_message(&mut subscriber)))
        .collect();
    controller.stop().expect("stop");

    for frame in &frames {
        assert_eq!((frame.width(), frame.height()), (64, 32));
    }
    assert!(frames[0].pixels().all(|p| p.0 == [0, 0, 0]));
    assert!(frames[1].pixels().all(|p| p.0 == [0, 0, 0]));
    assert!(frames[2..]
        .iter()
        .all(|frame| frame.pixels().any(|p| p.0 != [0, 0, 0])));

    // The transport is closed on stop, so the subscriber sees end of stream.
    let mut rest = Vec::new();
    let _ = subscriber.read_to_end(&mut rest);
}
