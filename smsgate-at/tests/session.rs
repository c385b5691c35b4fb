use std::time::Duration;

use smsgate_at::*;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

/// Modem side of a duplex pipe, reading commands and writing raw replies.
struct FakeModem {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeModem {
    async fn next_command(&mut self) -> String {
        let mut buf = Vec::new();
        self.reader.read_until(b'\r', &mut buf).await.unwrap();
        String::from_utf8(buf).unwrap().trim().to_owned()
    }

    async fn send(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
    }
}

fn pair() -> (AtSession, FakeModem) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (client, modem) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(modem);
    (
        AtSession::new(client),
        FakeModem {
            reader: BufReader::new(reader),
            writer,
        },
    )
}

#[tokio::test]
async fn response_lines_exclude_interleaved_ring() {
    let (session, mut modem) = pair();

    let modem_task = tokio::spawn(async move {
        assert_eq!(modem.next_command().await, "AT+CSQ");
        modem.send("\r\n+CSQ: 20,99\r\n\r\nRING\r\n\r\nOK\r\n").await;
        modem
    });

    let response = session.execute(&AtCommand::signal_quality()).await.unwrap();
    assert_eq!(response.lines(), ["+CSQ: 20,99"]);

    let urcs = session.poll_unsolicited().unwrap();
    assert_eq!(urcs.len(), 1);
    assert_eq!(urcs[0].kind(), UrcKind::Ring);

    modem_task.await.unwrap();
}

#[tokio::test]
async fn echo_is_skipped() {
    let (session, mut modem) = pair();

    tokio::spawn(async move {
        let command = modem.next_command().await;
        modem.send(&format!("{command}\r\r\nOK\r\n")).await;
        modem
    });

    let response = session.execute(&AtCommand::probe()).await.unwrap();
    assert!(response.is_empty());
}

#[tokio::test]
async fn error_result_is_a_rejection() {
    let (session, mut modem) = pair();

    tokio::spawn(async move {
        modem.next_command().await;
        modem.send("\r\n+CMS ERROR: 321\r\n").await;
        modem
    });

    let err = session
        .execute(&AtCommand::read_message(9))
        .await
        .unwrap_err();
    match &err {
        SessionError::ModemRejection { command, reason } => {
            assert_eq!(command, "AT+CMGR=9");
            assert_eq!(reason, "+CMS ERROR: 321");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn idle_poll_is_empty_and_repeatable() {
    let (session, _modem) = pair();

    assert!(session.poll_unsolicited().unwrap().is_empty());
    assert!(session.poll_unsolicited().unwrap().is_empty());
}

#[tokio::test]
async fn lines_between_commands_are_unsolicited() {
    let (session, mut modem) = pair();

    modem.send("\r\n+CMTI: \"ME\",3\r\n").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let modem_task = tokio::spawn(async move {
        modem.next_command().await;
        modem.send("\r\nOK\r\n").await;
        modem
    });

    // The stale line is diverted before the command goes out.
    session.execute(&AtCommand::probe()).await.unwrap();
    modem_task.await.unwrap();

    let urcs = session.poll_unsolicited().unwrap();
    assert_eq!(
        urcs.iter().map(|u| u.kind()).collect::<Vec<_>>(),
        [UrcKind::NewMessage {
            storage: "ME".into(),
            index: 3
        }]
    );
    assert!(session.poll_unsolicited().unwrap().is_empty());
}

#[tokio::test]
async fn closed_transport_is_fatal() {
    let (session, mut modem) = pair();

    modem.send("RING\r\n").await;
    drop(modem);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session.execute(&AtCommand::probe()).await.unwrap_err();
    assert!(err.is_fatal());

    // Lines received before the close are still handed out once.
    assert_eq!(session.poll_unsolicited().unwrap().len(), 1);
    assert!(matches!(
        session.poll_unsolicited(),
        Err(SessionError::TransportClosed)
    ));
}

#[tokio::test]
async fn message_text_reading_like_result_codes_is_payload() {
    let (session, mut modem) = pair();

    let modem_task = tokio::spawn(async move {
        assert_eq!(modem.next_command().await, "AT+CMGL=\"ALL\"");
        modem
            .send(concat!(
                "\r\n+CMGL: 0,\"REC UNREAD\",\"+15550001\",,\"25/10/25,19:33:13+00\"\r\nOK\r\n",
                "+CMGL: 1,\"REC UNREAD\",\"+15550002\",,\"25/10/25,19:34:13+00\"\r\nRING\r\n",
                "+CMGL: 2,\"REC UNREAD\",\"+15550003\",,\"25/10/25,19:35:13+00\"\r\nhello\r\n",
                "\r\nOK\r\n",
            ))
            .await;
        modem
    });

    let response = session
        .execute(&AtCommand::list_messages(MessageMode::Text))
        .await
        .unwrap();
    let bodies: Vec<_> = responses::parse_message_list(&response)
        .into_iter()
        .map(|m| (m.index, m.body))
        .collect();
    assert_eq!(
        bodies,
        [(0, "OK".to_owned()), (1, "RING".to_owned()), (2, "hello".to_owned())]
    );
    assert!(session.poll_unsolicited().unwrap().is_empty());

    modem_task.await.unwrap();
}

#[tokio::test]
async fn empty_payload_still_ends_at_result() {
    let (session, mut modem) = pair();

    let modem_task = tokio::spawn(async move {
        assert_eq!(modem.next_command().await, "AT+CMGR=4");
        modem
            .send("\r\n+CMGR: \"REC READ\",\"+15550001\",,\"25/10/25,19:33:13+00\"\r\n\r\n\r\nOK\r\n")
            .await;
        modem
    });

    let response = session.execute(&AtCommand::read_message(4)).await.unwrap();
    let message = responses::parse_read_message(4, &response).unwrap();
    assert_eq!(message.body, "");

    modem_task.await.unwrap();
}

#[tokio::test]
async fn late_result_of_timed_out_command_is_discarded() {
    let (session, mut modem) = pair();

    let modem_task = tokio::spawn(async move {
        assert_eq!(modem.next_command().await, "AT");
        tokio::time::sleep(Duration::from_millis(100)).await;
        modem.send("\r\nOK\r\n").await;

        assert_eq!(modem.next_command().await, "AT+CSQ");
        modem.send("\r\n+CSQ: 20,99\r\n\r\nOK\r\n").await;
        modem
    });

    let stalled = AtCommand::probe().with_timeout(Duration::from_millis(50));
    let err = session.execute(&stalled).await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout { .. }));

    let response = session.execute(&AtCommand::signal_quality()).await.unwrap();
    assert_eq!(response.lines(), ["+CSQ: 20,99"]);

    modem_task.await.unwrap();
}
