use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iothub_transport::message::MessageCallback;
use iothub_transport::{
    DeviceClient, Error, IotHubStatusCode, Message, MessageResult, Protocol, SendTask, Tick,
    Transport, TransportQueues, TransportState,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behaviour {
    /// Complete every drained packet with `Ok`
    Deliver,
    /// Leave packets queued
    Stall,
    /// Fail the first send with an i/o error and panic on the second
    Flaky,
}

struct MockTransport {
    queues: Arc<TransportQueues>,
    behaviour: Behaviour,
    sends: Arc<AtomicUsize>,
    inbox: Arc<Mutex<Vec<Message>>>,
    callback: Option<MessageCallback>,
}

impl MockTransport {
    fn new(behaviour: Behaviour) -> Self {
        Self {
            queues: TransportQueues::new(),
            behaviour,
            sends: Arc::new(AtomicUsize::new(0)),
            inbox: Arc::new(Mutex::new(Vec::new())),
            callback: None,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn protocol(&self) -> Protocol {
        Protocol::Amqps
    }

    fn queues(&self) -> &Arc<TransportQueues> {
        &self.queues
    }

    fn set_message_callback(&mut self, callback: MessageCallback) {
        self.callback = Some(callback);
    }

    async fn open(&mut self) -> iothub_transport::Result<()> {
        self.queues.set_state(TransportState::Open);
        Ok(())
    }

    async fn close(&mut self) -> iothub_transport::Result<()> {
        self.queues.begin_close();
        self.queues.set_state(TransportState::Closed);
        Ok(())
    }

    async fn send_messages(&mut self) -> iothub_transport::Result<()> {
        let call = self.sends.fetch_add(1, Ordering::SeqCst);
        match (self.behaviour, call) {
            (Behaviour::Stall, _) => Ok(()),
            (Behaviour::Flaky, 0) => Err(Error::IoError(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))),
            (Behaviour::Flaky, 1) => panic!("unexpected runtime failure"),
            _ => {
                let packets = self.queues.drain_outbound();
                self.queues.complete_all(packets, IotHubStatusCode::Ok);
                Ok(())
            }
        }
    }

    async fn handle_message(&mut self) -> iothub_transport::Result<()> {
        let message = self.inbox.lock().unwrap().pop();
        if let (Some(message), Some(callback)) = (message, &self.callback) {
            callback(&message);
        }
        Ok(())
    }
}

type Log = Arc<Mutex<Vec<(u32, IotHubStatusCode)>>>;

fn send(client: &DeviceClient, log: &Log, context: u32) -> iothub_transport::Result<()> {
    let log = log.clone();
    client.send_event_async(
        Message::new(format!("message {}", context).into_bytes()),
        move |status, context| log.lock().unwrap().push((context, status)),
        context,
    )
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn every_message_is_called_back_once_with_its_context() {
    init_logger();
    let mut client = DeviceClient::new(Box::new(MockTransport::new(Behaviour::Deliver)))
        .with_periods(Duration::from_millis(5), Duration::from_millis(5));
    client.open().await.unwrap();
    let log = Log::default();

    for context in 0..3 {
        send(&client, &log, context).unwrap();
    }
    assert!(wait_for(|| log.lock().unwrap().len() == 3).await);
    client.close().await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (0, IotHubStatusCode::Ok),
            (1, IotHubStatusCode::Ok),
            (2, IotHubStatusCode::Ok)
        ]
    );
}

#[tokio::test]
async fn close_reports_queued_messages_as_cancelled() {
    init_logger();
    let mut client = DeviceClient::new(Box::new(MockTransport::new(Behaviour::Stall)))
        .with_periods(Duration::from_millis(5), Duration::from_millis(5));
    client.open().await.unwrap();
    let log = Log::default();
    send(&client, &log, 1).unwrap();
    send(&client, &log, 2).unwrap();

    client.close().await.unwrap();

    assert_eq!(client.state(), TransportState::Closed);
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            (1, IotHubStatusCode::MessageCancelledOnClose),
            (2, IotHubStatusCode::MessageCancelledOnClose)
        ]
    );
    assert!(matches!(
        send(&client, &log, 3),
        Err(Error::TransportClosed)
    ));
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn send_before_open_is_refused() {
    let client = DeviceClient::new(Box::new(MockTransport::new(Behaviour::Deliver)));
    let log = Log::default();
    assert!(matches!(send(&client, &log, 0), Err(Error::TransportClosed)));
}

#[tokio::test]
async fn send_task_survives_failures() {
    init_logger();
    let mut transport = MockTransport::new(Behaviour::Flaky);
    let sends = transport.sends.clone();
    transport.open().await.unwrap();
    let queues = transport.queues().clone();
    let shared: Arc<tokio::sync::Mutex<Box<dyn Transport>>> =
        Arc::new(tokio::sync::Mutex::new(Box::new(transport)));
    let task = SendTask::new(shared);

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    queues
        .enqueue(iothub_transport::OutboundPacket::new(
            Message::new(vec![1]),
            move |status, _: ()| {
                assert_eq!(status, IotHubStatusCode::Ok);
                counter.fetch_add(1, Ordering::SeqCst);
            },
            (),
        ))
        .unwrap();

    // I/O failure, then a panic, then a normal tick
    task.run().await;
    task.run().await;
    task.run().await;

    assert_eq!(sends.load(Ordering::SeqCst), 3);
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn receive_task_delivers_to_message_callback() {
    init_logger();
    let transport = MockTransport::new(Behaviour::Deliver);
    let inbox = transport.inbox.clone();
    inbox
        .lock()
        .unwrap()
        .push(Message::new(b"from the cloud".to_vec()));

    let mut client = DeviceClient::new(Box::new(transport))
        .with_periods(Duration::from_millis(5), Duration::from_millis(5));
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    client
        .set_message_callback(move |message| {
            sink.lock().unwrap().push(message.body().to_vec());
            MessageResult::Complete
        })
        .await;
    client.open().await.unwrap();

    assert!(wait_for(|| !received.lock().unwrap().is_empty()).await);
    client.close().await.unwrap();
    assert_eq!(*received.lock().unwrap(), vec![b"from the cloud".to_vec()]);
}

fn test_config() -> (String, String, String) {
    (
        env::var("IOTHUB_HOSTNAME").unwrap_or("azure-iot-sdk-rs.azure-devices.net".to_string()),
        env::var("IOT_DEVICE_ID").unwrap(),
        env::var("IOT_DEVICE_ACCESS_KEY").unwrap(),
    )
}

#[tokio::test]
#[ignore = "needs a live hub and device credentials"]
async fn test_connect() {
    let (hostname, device_id, access_key) = test_config();
    let mut client = DeviceClient::builder()
        .iothub_details(hostname, device_id)
        .access_key(access_key)
        .unwrap()
        .protocol(Protocol::Mqtt)
        .build()
        .unwrap();
    assert!(client.open().await.is_ok());
    assert!(client.close().await.is_ok());
}
