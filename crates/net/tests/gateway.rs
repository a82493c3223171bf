use map646_core::{AddressFamily, Router};
use map646_net::checksum::upper_layer_checksum;
use map646_net::packet::Ipv4HeaderFields;
use map646_net::{
    Control, FixedSourceSelector, Gateway, MappingTable, OutboundPacket, PacketIO, Translator,
    TranslatorConfig,
};
use smoltcp::wire::{IpProtocol, Ipv6Packet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

struct ChannelIo {
    inbound: mpsc::UnboundedReceiver<(AddressFamily, Vec<u8>)>,
    outbound: mpsc::UnboundedSender<OutboundPacket>,
}

impl PacketIO for ChannelIo {
    fn poll_recv(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<(AddressFamily, usize)>> {
        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some((family, packet))) => {
                buf[..packet.len()].copy_from_slice(&packet);
                Poll::Ready(Ok((family, packet.len())))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "device closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn send(&mut self, packet: &OutboundPacket) -> io::Result<()> {
        self.outbound
            .send(packet.clone())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "receiver gone"))
    }
}

#[derive(Clone, Default)]
struct RecordingRouter {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingRouter {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }
}

impl Router for RecordingRouter {
    fn add_host_route(&mut self, addr: IpAddr) -> map646_core::Result<()> {
        self.log.lock().unwrap().push(format!("host {addr}"));
        Ok(())
    }

    fn add_network_route(&mut self, prefix: IpAddr, prefix_len: u8) -> map646_core::Result<()> {
        self.log.lock().unwrap().push(format!("net {prefix}/{prefix_len}"));
        Ok(())
    }

    fn add_policy_rule(&mut self, addr: IpAddr, prefix_len: u8) -> map646_core::Result<()> {
        self.log.lock().unwrap().push(format!("rule {addr}/{prefix_len}"));
        Ok(())
    }

    fn remove_all(&mut self, family: AddressFamily) -> map646_core::Result<()> {
        self.log.lock().unwrap().push(format!("remove {family}"));
        Ok(())
    }
}

struct Harness {
    dir: tempfile::TempDir,
    packets: mpsc::UnboundedSender<(AddressFamily, Vec<u8>)>,
    translated: mpsc::UnboundedReceiver<OutboundPacket>,
    router: RecordingRouter,
    gateway: Gateway<ChannelIo, RecordingRouter, FixedSourceSelector>,
}

fn harness(config: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("map646.conf");
    std::fs::write(&path, config).unwrap();

    let (packets, inbound) = mpsc::unbounded_channel();
    let (outbound, translated) = mpsc::unbounded_channel();
    let router = RecordingRouter::default();
    let translator = Translator::with_source_selector(
        MappingTable::new(),
        TranslatorConfig::default(),
        FixedSourceSelector {
            ipv4: Ipv4Addr::new(203, 0, 113, 1),
            ipv6: "2001:db8:ffff::1".parse().unwrap(),
        },
    );
    let gateway = Gateway::new(ChannelIo { inbound, outbound }, router.clone(), translator, path);

    Harness {
        dir,
        packets,
        translated,
        router,
        gateway,
    }
}

fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
    let mut datagram = vec![0x13, 0x88, 0x00, 0x35, 0x00, 0x0c, 0x00, 0x00, b'p', b'i', b'n', b'g'];
    let sum = upper_layer_checksum(src.into(), dst.into(), 17, &datagram).unwrap();
    datagram[6..8].copy_from_slice(&sum.to_be_bytes());

    let mut packet = Ipv4HeaderFields {
        src,
        dst,
        protocol: IpProtocol::Udp,
        ttl: 64,
        ident: 1,
        dont_frag: true,
        more_frags: false,
        frag_offset: 0,
    }
    .emit(datagram.len());
    packet.extend_from_slice(&datagram);
    packet
}

fn destination(packet: &OutboundPacket) -> Ipv6Addr {
    let bytes = packet.to_bytes();
    Ipv6Packet::new_checked(&bytes[..]).unwrap().dst_addr()
}

const CONFIG: &str = "mapping-prefix 64:ff9b::\nmap-static 192.0.2.10 2001:db8::10\n";

#[tokio::test]
async fn start_installs_routes() {
    let mut h = harness("mapping-prefix 64:ff9b::\nmap-static 192.0.2.10 2001:db8::10\nmap66-static fd00::1 2001:db8:1::1\n");
    h.gateway.start().unwrap();

    assert_eq!(
        h.router.take(),
        vec![
            "host 192.0.2.10".to_string(),
            "net 64:ff9b::/96".to_string(),
            "rule 2001:db8:1::1/128".to_string(),
        ]
    );
    let mapping = h.gateway.translator().mapping();
    assert_eq!(mapping.entries().len(), 1);
    assert_eq!(mapping.entries66().len(), 1);
    assert_eq!(mapping.len(), 2);
}

#[tokio::test]
async fn start_fails_without_config_file() {
    let mut h = harness(CONFIG);
    std::fs::remove_file(h.gateway.config_path()).unwrap();
    assert!(h.gateway.start().is_err());
}

#[tokio::test]
async fn translates_packets_and_reloads_between_them() {
    let Harness {
        dir,
        packets,
        mut translated,
        router,
        mut gateway,
    } = harness(CONFIG);
    gateway.start().unwrap();
    router.take();

    let (control, mut control_rx) = mpsc::channel(4);
    let task = tokio::spawn(async move {
        let result = gateway.serve(&mut control_rx).await;
        (gateway, result)
    });

    let source = Ipv4Addr::new(198, 51, 100, 7);
    let mapped = Ipv4Addr::new(192, 0, 2, 10);
    packets.send((AddressFamily::Inet, udp_packet(source, mapped))).unwrap();
    let out = translated.recv().await.unwrap();
    assert_eq!(out.family, AddressFamily::Inet6);
    assert_eq!(destination(&out), "2001:db8::10".parse::<Ipv6Addr>().unwrap());

    std::fs::write(
        dir.path().join("map646.conf"),
        "mapping-prefix 64:ff9b::\nmap-static 192.0.2.10 2001:db8::99\n",
    )
    .unwrap();
    control.send(Control::Reload).await.unwrap();
    packets.send((AddressFamily::Inet, udp_packet(source, mapped))).unwrap();
    let out = translated.recv().await.unwrap();
    assert_eq!(destination(&out), "2001:db8::99".parse::<Ipv6Addr>().unwrap());

    assert_eq!(
        router.take(),
        vec![
            "remove inet".to_string(),
            "remove inet6".to_string(),
            "host 192.0.2.10".to_string(),
            "net 64:ff9b::/96".to_string(),
        ]
    );

    control.send(Control::Shutdown).await.unwrap();
    let (_gateway, result) = task.await.unwrap();
    result.unwrap();
    assert_eq!(
        router.take(),
        vec!["remove inet".to_string(), "remove inet6".to_string()]
    );
}

#[tokio::test]
async fn dropped_packets_produce_no_output() {
    let Harness {
        dir: _dir,
        packets,
        mut translated,
        router: _router,
        mut gateway,
    } = harness(CONFIG);
    gateway.start().unwrap();

    let (control, mut control_rx) = mpsc::channel(4);
    let task = tokio::spawn(async move { gateway.serve(&mut control_rx).await });

    let source = Ipv4Addr::new(198, 51, 100, 7);
    packets
        .send((AddressFamily::Inet, udp_packet(source, Ipv4Addr::new(192, 0, 2, 99))))
        .unwrap();
    packets.send((AddressFamily::Inet, vec![0x45, 0x00])).unwrap();
    packets
        .send((AddressFamily::Inet, udp_packet(source, Ipv4Addr::new(192, 0, 2, 10))))
        .unwrap();

    let out = translated.recv().await.unwrap();
    assert_eq!(destination(&out), "2001:db8::10".parse::<Ipv6Addr>().unwrap());
    assert!(translated.try_recv().is_err());

    drop(control);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_reload_stops_the_loop() {
    let Harness {
        dir,
        packets: _packets,
        translated: _translated,
        router,
        mut gateway,
    } = harness(CONFIG);
    gateway.start().unwrap();
    router.take();

    let (control, mut control_rx) = mpsc::channel(4);
    let task = tokio::spawn(async move { gateway.serve(&mut control_rx).await });

    std::fs::remove_file(dir.path().join("map646.conf")).unwrap();
    control.send(Control::Reload).await.unwrap();

    assert!(task.await.unwrap().is_err());
    let log = router.take();
    assert_eq!(log.last().map(String::as_str), Some("remove inet6"));
}

#[tokio::test]
async fn closed_device_is_an_error() {
    let Harness {
        dir: _dir,
        packets,
        translated: _translated,
        router: _router,
        mut gateway,
    } = harness(CONFIG);
    gateway.start().unwrap();
    drop(packets);

    let (_control, mut control_rx) = mpsc::channel(4);
    assert!(gateway.serve(&mut control_rx).await.is_err());
}
