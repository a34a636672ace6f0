use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

/// RTP固定ヘッダ長
const RTP_HEADER_LEN: usize = 12;

/// 受信バッファサイズ（MTU相当）
const MAX_DATAGRAM_LEN: usize = 1500;

/// RTCPと衝突するペイロードタイプの範囲 (RFC 5761)
const RTCP_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 64..=95;

/// 解析済みRTPパケット
#[derive(Debug, PartialEq, Eq)]
pub struct RtpPacket<'a> {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// ヘッダ・CSRC・拡張・パディングを除いたペイロード
    pub payload: &'a [u8],
}

impl<'a> RtpPacket<'a> {
    /// データグラムからRTPパケットを解析
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            anyhow::bail!("RTPパケットが短すぎます: {} バイト", data.len());
        }

        let version = data[0] >> 6;
        if version != 2 {
            anyhow::bail!("未対応のRTPバージョン: {}", version);
        }

        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7f;
        let sequence_number = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if extension {
            if data.len() < offset + 4 {
                anyhow::bail!("RTP拡張ヘッダが不完全です");
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
        }

        let mut end = data.len();
        if padding {
            let pad_len = data[end - 1] as usize;
            if pad_len == 0 || pad_len > end {
                anyhow::bail!("RTPパディング長が不正です: {}", pad_len);
            }
            end -= pad_len;
        }

        if offset > end {
            anyhow::bail!("RTPヘッダ長がパケット長を超えています");
        }

        Ok(Self {
            payload_type,
            marker,
            sequence_number,
            timestamp,
            ssrc,
            payload: &data[offset..end],
        })
    }

    /// RTCPのペイロードタイプ範囲かどうか
    pub fn is_rtcp(&self) -> bool {
        RTCP_PAYLOAD_TYPES.contains(&self.payload_type)
    }
}

/// RTP受信ワーカー
///
/// ソケットから読み取ったRTPパケットのヘッダを除き、音声バイト列を
/// `audio_tx` へ送る。RTCP範囲のパケットは黙って捨てる。
/// 読み取りエラー、停止シグナル、送信先のクローズで終了し、再試行はしない。
pub async fn run_ingest(
    socket: UdpSocket,
    audio_tx: mpsc::Sender<Vec<u8>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let local_addr = socket.local_addr().ok();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    let mut forwarded: u64 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let len = tokio::select! {
            res = socket.recv_from(&mut buf) => match res {
                Ok((len, _)) => len,
                Err(e) => {
                    log::warn!("RTP受信エラー ({:?}): {}", local_addr, e);
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        };

        let packet = match RtpPacket::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("RTPパケットを破棄: {}", e);
                continue;
            }
        };

        if packet.is_rtcp() {
            continue;
        }

        if audio_tx.send(packet.payload.to_vec()).await.is_err() {
            log::debug!("RTP受信ワーカー: 送信先がクローズされました");
            break;
        }
        forwarded += 1;
    }

    log::debug!(
        "RTP受信ワーカーを終了 ({:?}): {} パケット転送",
        local_addr,
        forwarded
    );
}
