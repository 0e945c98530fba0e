//! Connectionless traffic: unconnected datagrams, broadcast dispatch, the
//! raw socket hook and checksum rejection.

mod common;

use bytes::BufMut;
use common::*;
use peerlink::packet_header::{PacketFlags, PacketHeader, PacketType};
use peerlink::{Host, HostConfig};
use tokio::net::UdpSocket;

fn raw_packet(packet_type: PacketType, crc: bool, payload: &[u8]) -> Vec<u8> {
    let flags = if crc { PacketFlags::VERIFIED } else { PacketFlags::empty() };
    let header = PacketHeader::new(packet_type, flags);
    let mut packet = Vec::with_capacity(header.serialized_len() + payload.len());
    header.ser(&mut packet);
    packet.put_slice(payload);
    PacketHeader::patch_crc(&mut packet);
    packet
}

#[tokio::test(flavor = "multi_thread")]
async fn discovery_roundtrip_broadcast_then_unconnected() {
    let (listener_a, mut host_events_a) = host_listener();
    let host_a = Host::new(
        HostConfig { broadcast: true, ..HostConfig::default() },
        listener_a,
    )
    .await
    .unwrap();

    // a bare discovery client announcing itself with a BROADCAST packet
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let announce = raw_packet(PacketType::Broadcast, true, b"anyone there?");
    client.send_to(&announce, local_addr_of(&host_a)).await.unwrap();

    let (remote, payload) = wait_for(&mut host_events_a, |event| match event {
        HostEvent::Broadcast(remote, payload) => Some((remote, payload)),
        _ => None,
    })
    .await;
    assert_eq!(&payload[..], b"anyone there?");
    assert_eq!(remote, client.local_addr().unwrap());

    // reply outside any connection
    host_a.send_unconnected(remote, b"here").await.unwrap();

    let mut buf = [0u8; 1500];
    let (length, from) = tokio::time::timeout(EVENT_TIMEOUT, client.recv_from(&mut buf))
        .await
        .expect("no unconnected reply")
        .unwrap();
    assert_eq!(from.port(), local_addr_of(&host_a).port());

    let mut read: &[u8] = &buf[..length];
    let header = PacketHeader::deser(&mut read, true).unwrap();
    assert_eq!(header.packet_type, PacketType::Unconnected);
    assert_eq!(read, b"here");
}

#[tokio::test(flavor = "multi_thread")]
async fn unconnected_packets_reach_the_listener() {
    let (listener_a, mut host_events_a) = host_listener();
    let host_a = Host::new(HostConfig::default(), listener_a).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = raw_packet(PacketType::Unconnected, true, b"hello out there");
    client.send_to(&packet, local_addr_of(&host_a)).await.unwrap();

    let payload = wait_for(&mut host_events_a, |event| match event {
        HostEvent::Unconnected(_, payload) => Some(payload),
        _ => None,
    })
    .await;
    assert_eq!(&payload[..], b"hello out there");
}

#[tokio::test(flavor = "multi_thread")]
async fn corrupted_packet_is_rejected_with_an_exception() {
    let (listener_a, mut host_events_a) = host_listener();
    let host_a = Host::new(HostConfig::default(), listener_a).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut packet = raw_packet(PacketType::Unconnected, true, b"payload");
    let last = packet.len() - 1;
    packet[last] ^= 0x01;
    client.send_to(&packet, local_addr_of(&host_a)).await.unwrap();

    let (remote, error) = wait_for(&mut host_events_a, |event| match event {
        HostEvent::Exception(remote, error) => Some((remote, error)),
        HostEvent::Unconnected(..) => panic!("corrupted packet was delivered"),
        _ => None,
    })
    .await;
    assert_eq!(remote, Some(client.local_addr().unwrap()));
    assert!(matches!(error, peerlink::TransportError::CrcMismatch { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn unattributed_traffic_hits_the_socket_hook() {
    let (listener_a, mut host_events_a) = host_listener();
    let host_a = Host::new(HostConfig::default(), listener_a).await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    // a CONNECTED packet from a remote that never completed a handshake
    let stray = raw_packet(PacketType::Connected, true, &[0x00, 1, 2, 3]);
    client.send_to(&stray, local_addr_of(&host_a)).await.unwrap();

    let (remote, datagram) = wait_for(&mut host_events_a, |event| match event {
        HostEvent::Socket(remote, datagram) => Some((remote, datagram)),
        _ => None,
    })
    .await;
    assert_eq!(remote, client.local_addr().unwrap());
    assert_eq!(&datagram[..], &stray[..]);
}

#[tokio::test(flavor = "multi_thread")]
async fn broadcast_requires_the_capability() {
    let (listener_a, _events) = host_listener();
    let host_a = Host::new(
        HostConfig { broadcast: false, ..HostConfig::default() },
        listener_a,
    )
    .await
    .unwrap();

    let result = host_a.send_broadcast(44015, b"discovery").await;
    assert!(result.is_err());
}
