//! End-to-end sessions against the hub over in-memory streams: handshakes,
//! cross-protocol chat, private chat and departure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hub_server::{Hub, HubConfig, Nickname};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn test_hub() -> Arc<Hub>
{
    let config = HubConfig {
        name: "TestHub".to_string(),
        ..HubConfig::default()
    };
    Hub::new(config, None)
}

fn addr(s: &str) -> SocketAddr
{
    s.parse().unwrap()
}

fn nick(s: &str) -> Nickname
{
    Nickname::new(s).unwrap()
}

struct Client
{
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client
{
    async fn send(&mut self, raw: &str)
    {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
    }

    /// One line, CR/LF stripped.
    async fn recv(&mut self) -> String
    {
        let mut line = String::new();
        timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        assert!(!line.is_empty(), "connection closed by hub");
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        line
    }

    /// One `|`-terminated NMDC command.
    async fn recv_nmdc(&mut self) -> String
    {
        let mut raw = Vec::new();
        timeout(RECV_TIMEOUT, self.reader.read_until(b'|', &mut raw))
            .await
            .expect("timed out waiting for a command")
            .unwrap();
        assert!(!raw.is_empty(), "connection closed by hub");
        if raw.last() == Some(&b'|') {
            raw.pop();
        }
        String::from_utf8(raw).unwrap()
    }

    async fn expect(&mut self, want: &str)
    {
        assert_eq!(self.recv().await, want);
    }

    async fn recv_until(&mut self, prefix: &str) -> String
    {
        loop {
            let line = self.recv().await;
            if line.starts_with(prefix) {
                return line;
            }
        }
    }

    async fn expect_silence(&mut self)
    {
        let mut line = String::new();
        let read = timeout(Duration::from_millis(200), self.reader.read_line(&mut line)).await;
        assert!(read.is_err(), "unexpected line: {:?}", line);
    }
}

fn connect(hub: &Arc<Hub>, proto: &'static str, remote: &str) -> Client
{
    let (client, server) = tokio::io::duplex(16384);
    let hub = hub.clone();
    let remote = addr(remote);
    let local = addr("127.0.0.1:411");
    tokio::spawn(async move {
        let _ = match proto {
            "irc" => hub.serve_irc(server, remote, local).await,
            "adc" => hub.serve_adc(server, remote, local).await,
            "nmdc" => hub.serve_nmdc(server, remote, local).await,
            other => panic!("unknown protocol {}", other),
        };
    });
    let (reader, writer) = tokio::io::split(client);
    Client { reader: BufReader::new(reader), writer }
}

/// Runs the full IRC login for `name` and returns the connected client.
async fn join_irc(hub: &Arc<Hub>, name: &str, remote: &str) -> Client
{
    let mut client = connect(hub, "irc", remote);
    client.send(&format!("NICK {}\r\nUSER {} 0 * :{}\r\n", name, name, name)).await;
    client.recv_until(":127.0.0.1 005 ").await;
    client.send("JOIN #hub\r\n").await;
    client
        .recv_until(&format!(":{}!{}@127.0.0.1 JOIN #hub", name, name))
        .await;
    client
}

const TEST_CID: &str = "AJBKLTIOZV47X6KJZZVOVY2JNXAZA26GTW6JJAA";

/// Runs the full ADC login for `name`; returns the client and its SID.
async fn join_adc(hub: &Arc<Hub>, name: &str, remote: &str) -> (Client, String)
{
    let mut client = connect(hub, "adc", remote);
    client.send("HSUP ADBASE ADTIGR\n").await;
    client.expect("ISUP ADBASE ADTIGR").await;

    client
        .send(&format!("BINF AAAA ID{} PD{} NI{}\n", TEST_CID, TEST_CID, name))
        .await;
    let isid = client.recv().await;
    let sid = isid.strip_prefix("ISID ").expect("expected an ISID frame").to_string();
    assert_eq!(sid.len(), 4);

    let iinf = client.recv().await;
    assert!(iinf.starts_with("IINF CT32 NITestHub"), "got: {}", iinf);

    client
        .send(&format!("BINF {} ID{} NI{} SUTCP4\n", sid, TEST_CID, name))
        .await;
    // roster replay ends with the hub's welcome message
    client.recv_until("IMSG ").await;
    (client, sid)
}

#[tokio::test]
async fn irc_handshake_happy_path()
{
    let hub = test_hub();
    let mut alice = connect(&hub, "irc", "10.0.0.1:5000");

    alice.send("NICK alice\r\nUSER alice 0 * :Alice\r\n").await;
    alice
        .expect(":127.0.0.1 001 alice :Welcome to the TestHub Internet Relay Chat Network alice")
        .await;
    let l002 = alice.recv().await;
    assert!(l002.starts_with(":127.0.0.1 002 alice :Your host is 127.0.0.1[127.0.0.1/411]"));
    let l003 = alice.recv().await;
    assert!(l003.starts_with(":127.0.0.1 003 alice :This server was created"));
    let l004 = alice.recv().await;
    assert!(l004.starts_with(":127.0.0.1 004 alice 127.0.0.1"));
    let l005 = alice.recv().await;
    assert!(l005.contains("CASEMAPPING=rfc1459"), "got: {}", l005);
    assert!(l005.contains("NETWORK=freenode"), "got: {}", l005);

    assert!(hub.peer_by_name(&nick("alice")).is_none());

    alice.send("JOIN #hub\r\n").await;
    alice.expect(":alice!alice@127.0.0.1 JOIN #hub").await;

    assert!(hub.peer_by_name(&nick("alice")).is_some());
    assert_eq!(hub.peer_count(), 1);
}

#[tokio::test]
async fn irc_nick_collision()
{
    let hub = test_hub();
    let _alice = join_irc(&hub, "alice", "10.0.0.1:5000").await;

    let mut bob = connect(&hub, "irc", "10.0.0.2:5000");
    bob.send("NICK alice\r\nUSER bob 0 * :Bob\r\n").await;
    bob.expect(":127.0.0.1 433 * alice :nickname is already in use").await;

    bob.send("NICK bob\r\n").await;
    bob.expect(":127.0.0.1 001 bob :Welcome to the TestHub Internet Relay Chat Network bob")
        .await;
    bob.recv_until(":127.0.0.1 005 ").await;
    bob.send("JOIN #hub\r\n").await;
    bob.expect(":bob!bob@127.0.0.1 JOIN #hub").await;
    // the roster replays alice's presence
    bob.expect(":alice!alice@127.0.0.1 JOIN #hub").await;

    assert_eq!(hub.peer_count(), 2);
}

#[tokio::test]
async fn pending_reservation_blocks_the_name()
{
    let hub = test_hub();
    let mut alice = connect(&hub, "irc", "10.0.0.1:5000");
    alice.send("NICK alice\r\nUSER alice 0 * :Alice\r\n").await;
    alice.recv_until(":127.0.0.1 005 ").await;
    // alice has not joined yet, so she is reserved but not live

    let mut bob = connect(&hub, "irc", "10.0.0.2:5000");
    bob.send("NICK alice\r\nUSER bob 0 * :Bob\r\n").await;
    bob.expect(":127.0.0.1 433 * alice :nickname is already in use").await;
}

#[tokio::test]
async fn cross_protocol_chat()
{
    let hub = test_hub();
    let mut alice = join_irc(&hub, "alice", "10.0.0.1:5000").await;
    let (mut bob, bob_sid) = join_adc(&hub, "bob", "10.0.0.2:5000").await;
    assert_eq!(bob_sid, "AAAC");

    // alice sees the ADC peer arrive in IRC terms
    alice.expect(":bob!bob@127.0.0.1 JOIN #hub").await;

    bob.send(&format!("BMSG {} hi\n", bob_sid)).await;
    alice.expect(":bob!bob@127.0.0.1 PRIVMSG #hub :hi").await;

    alice.send("PRIVMSG #hub :hello\r\n").await;
    bob.expect("BMSG AAAB hello").await;
    // the sender never sees its own public message
    alice.expect_silence().await;
}

#[tokio::test]
async fn private_chat_reaches_only_the_target()
{
    let hub = test_hub();
    let mut alice = join_irc(&hub, "alice", "10.0.0.1:5000").await;
    let (mut bob, _) = join_adc(&hub, "bob", "10.0.0.2:5000").await;
    let mut carol = join_irc(&hub, "carol", "10.0.0.3:5000").await;
    alice.recv_until(":bob!bob@127.0.0.1 JOIN #hub").await;
    alice.recv_until(":carol!carol@127.0.0.1 JOIN #hub").await;
    bob.recv_until("BINF AAAD").await;
    // drain carol's presence roster
    carol.recv_until(":bob!bob@127.0.0.1 JOIN #hub").await;

    alice.send("PRIVMSG bob :secret\r\n").await;
    bob.expect("EMSG AAAB AAAC secret PMAAAB").await;
    carol.expect_silence().await;

    // a private message to an unknown nick is dropped silently
    alice.send("PRIVMSG nobody :lost\r\n").await;
    alice.expect_silence().await;
    carol.expect_silence().await;
}

#[tokio::test]
async fn irc_private_chat_between_irc_peers()
{
    let hub = test_hub();
    let mut alice = join_irc(&hub, "alice", "10.0.0.1:5000").await;
    let mut bob = join_irc(&hub, "bob", "10.0.0.2:5000").await;
    alice.recv_until(":bob!bob@127.0.0.1 JOIN #hub").await;
    bob.recv_until(":alice!alice@127.0.0.1 JOIN #hub").await;

    alice.send("PRIVMSG bob :secret\r\n").await;
    bob.expect(":alice!alice@127.0.0.1 PRIVMSG bob :secret").await;
}

#[tokio::test]
async fn graceful_leave_frees_the_name()
{
    let hub = test_hub();
    let mut alice = join_irc(&hub, "alice", "10.0.0.1:5000").await;
    let mut bob = join_irc(&hub, "bob", "10.0.0.2:5000").await;
    alice.recv_until(":bob!bob@127.0.0.1 JOIN #hub").await;
    bob.recv_until(":alice!alice@127.0.0.1 JOIN #hub").await;

    // the client goes away; the hub observes EOF and leaves once
    drop(alice);
    bob.expect(":alice!alice@127.0.0.1 PART #hub :disconnect").await;
    assert!(hub.peer_by_name(&nick("alice")).is_none());
    assert_eq!(hub.peer_count(), 1);

    // the name is available again immediately
    let _alice = join_irc(&hub, "alice", "10.0.0.3:5000").await;
    assert_eq!(hub.peer_count(), 2);
}

#[tokio::test]
async fn adc_connect_requests_are_routed()
{
    let hub = test_hub();
    let (mut bob, bob_sid) = join_adc(&hub, "bob", "10.0.0.2:5000").await;
    let (mut dan, dan_sid) = join_adc(&hub, "dan", "10.0.0.3:5000").await;
    assert_eq!(bob_sid, "AAAB");
    assert_eq!(dan_sid, "AAAC");
    bob.recv_until("BINF AAAC").await;

    dan.send("DCTM AAAC AAAB ADC/1.0 3000 TOK\n").await;
    bob.expect("DCTM AAAC AAAB ADC/1.0 3000 TOK").await;

    bob.send("DRCM AAAB AAAC ADC/1.0 TOK2\n").await;
    dan.expect("DRCM AAAB AAAC ADC/1.0 TOK2").await;
}

#[tokio::test]
async fn adc_echo_frames_return_to_the_sender()
{
    let hub = test_hub();
    let (mut bob, _) = join_adc(&hub, "bob", "10.0.0.2:5000").await;
    let (mut dan, _) = join_adc(&hub, "dan", "10.0.0.3:5000").await;
    bob.recv_until("BINF AAAC").await;

    dan.send("EMSG AAAC AAAB hi PMAAAC\n").await;
    bob.expect("EMSG AAAC AAAB hi PMAAAC").await;
    dan.expect("EMSG AAAC AAAB hi PMAAAC").await;
}

#[tokio::test]
async fn nmdc_handshake_and_chat()
{
    let hub = test_hub();
    let mut alice = join_irc(&hub, "alice", "10.0.0.1:5000").await;

    let mut dave = connect(&hub, "nmdc", "10.0.0.4:5000");
    let lock = dave.recv_nmdc().await;
    assert!(lock.starts_with("$Lock EXTENDEDPROTOCOL"), "got: {}", lock);

    dave.send("$Supports NoHello|$Key x|$ValidateNick dave|").await;
    assert_eq!(dave.recv_nmdc().await, "$HubName TestHub");
    assert_eq!(dave.recv_nmdc().await, "$Hello dave");

    dave.send("$Version 1,0091|$GetNickList|$MyINFO $ALL dave desc$ $\u{1}$$0$|").await;
    let roster_alice = dave.recv_nmdc().await;
    assert!(roster_alice.starts_with("$MyINFO $ALL alice"), "got: {}", roster_alice);
    assert_eq!(dave.recv_nmdc().await, "$MyINFO $ALL dave desc$ $\u{1}$$0$");
    let list = dave.recv_nmdc().await;
    assert_eq!(list, "$NickList alice$$dave$$");

    alice.expect(":dave!dave@127.0.0.1 JOIN #hub").await;
    dave.send("<dave> hello|").await;
    alice.expect(":dave!dave@127.0.0.1 PRIVMSG #hub :hello").await;

    alice.send("PRIVMSG #hub :hi dave\r\n").await;
    assert_eq!(dave.recv_nmdc().await, "<alice> hi dave");
}

#[tokio::test]
async fn nmdc_nick_collision_retries_like_irc()
{
    let hub = test_hub();
    let _alice = join_irc(&hub, "alice", "10.0.0.1:5000").await;

    let mut dave = connect(&hub, "nmdc", "10.0.0.4:5000");
    dave.recv_nmdc().await; // $Lock
    dave.send("$ValidateNick alice|").await;
    assert_eq!(dave.recv_nmdc().await, "$ValidateDenide alice");

    dave.send("$ValidateNick dave|").await;
    assert_eq!(dave.recv_nmdc().await, "$HubName TestHub");
    assert_eq!(dave.recv_nmdc().await, "$Hello dave");
}
