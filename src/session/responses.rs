// Beeclear 応答電文
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use serde::{Deserialize, Serialize};

/// 料金設定
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Tariff {
    pub gas: f64,
    pub elek_hoog: f64,
    pub elek_laag: f64,
    pub gasvast24h: f64,
    pub elekvast24h: f64,
}

/// 計測開始時刻
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct StartTime {
    pub gas: i64,
    pub elek: i64,
    pub elekw: i64,
}

/// 機器の設定
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceSetting {
    pub landcode: String,
    pub user: String,
    pub auth: String,
    pub metertype: bool,
    pub mijnmeter: bool,
    /// ガスメーターあり
    pub showgas: bool,
    pub gas_use_elek_time: bool,
    /// 2料金制メーター
    pub dubbeltariefmeter: bool,
    /// 売電あり
    pub levering: bool,
    pub testfirmware: bool,
    pub enable_https: bool,
    pub enable_mqtt: bool,
    /// 三相計測
    pub driefase_meting: bool,
    pub rawlogging: bool,
    pub dsmrtime: bool,
    pub cert_use: bool,
    pub tarief: Tariff,
    pub starttime: StartTime,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct GasMeterSerial {
    pub slot: u32,
    pub serial: String,
}

/// ソフトウェアバージョンと設定
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SoftwareVersion {
    pub info: String,
    pub name: String,
    pub serial_elec: String,
    pub gas: Vec<GasMeterSerial>,
    pub protocol_version: String,
    pub uptime: u64,
    pub hardware: String,
    pub firmware: String,
    pub time_sync: i64,
    pub setting: DeviceSetting,
}

/// SDカードとP1ポートの状態
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceStatus {
    pub p1: i64,
    pub sdcard: i64,
    pub sdcard_free: String,
    pub sdcard_total: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct FirmwareFile {
    pub file: String,
    pub version: String,
}

/// ファームウェア一覧
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct FirmwareList {
    pub info: String,
    pub firmware: Vec<FirmwareFile>,
    pub firmware_new: String,
    pub firmware_test: String,
    pub current: String,
    pub setting: DeviceSetting,
}

/// 有線LANの状態
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct EthernetStatus {
    pub ip: String,
    pub netmask: String,
    pub router: String,
    pub dns: String,
    pub link: String,
    pub speed: String,
    pub duplex: String,
    pub mac: String,
}

/// 無線LANの状態
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct WifiStatus {
    pub aan: i64,
    pub ip: String,
    pub netmask: String,
    pub router: String,
    pub dns: String,
    pub mode: String,
    pub wstatus: String,
    pub signal: String,
    pub ssid: String,
    pub mac: String,
}

/// ネットワークインターフェース
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct NetworkInterface {
    pub status: String,
    pub ip: String,
    pub netmask: String,
    pub proto: String,
    pub hostname: String,
    pub router: String,
    pub dns: String,
    pub mode: Option<String>,
    pub ssid: Option<String>,
    pub status_ethernet: Option<EthernetStatus>,
    pub status_info: Option<WifiStatus>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct NetworkInfo {
    pub eth: NetworkInterface,
    pub wifi: NetworkInterface,
}

impl NetworkInfo {
    /// 有線LANのMACアドレス(機器ID)
    pub fn mac(&self) -> Option<&str> {
        self.eth
            .status_ethernet
            .as_ref()
            .map(|s| s.mac.as_str())
            .filter(|s| !s.is_empty())
    }
}

#[test]
fn test_software_version() {
    let json = r#"{
  "info": "ok",
  "name": "XMX5XMXABCE000021673",
  "serialElec": "98108309        ",
  "gas": [ { "slot": 0, "serial": "28011001147026511" } ],
  "protocolVersion": "0",
  "uptime": 90672,
  "hardware": "2",
  "firmware": "49.10_NL",
  "timeSync": 2,
  "setting": {
    "landcode": "NL",
    "user": "beeclear",
    "auth": "admin",
    "metertype": true,
    "showgas": true,
    "dubbeltariefmeter": true,
    "levering": true,
    "driefaseMeting": false,
    "tarief": { "gas": 0.6, "elekHoog": 0.19512, "elekLaag": 0.17982, "gasvast24h": 0, "elekvast24h": 0 },
    "starttime": { "gas": 1600866000, "elek": 1600866000, "elekw": 1600868110 }
  }
}"#;
    let version = serde_json::from_str::<SoftwareVersion>(json).unwrap();
    assert_eq!(version.firmware, "49.10_NL");
    assert_eq!(version.gas[0].serial, "28011001147026511");
    assert!(version.setting.dubbeltariefmeter);
    assert!(!version.setting.driefase_meting);
    assert_eq!(version.setting.tarief.elek_hoog, 0.19512);
    assert_eq!(version.setting.starttime.elekw, 1600868110);
}

#[test]
fn test_network_info() {
    let json = r#"{
  "eth": {
    "status": "ok", "ip": "", "netmask": "", "proto": "dhcp", "hostname": "beeclear",
    "router": "", "dns": "",
    "status_ethernet": {
      "ip": "10.0.0.22", "netmask": "255.255.255.0", "router": "10.0.0.1", "dns": "10.0.0.1",
      "link": "up", "speed": "10", "duplex": "half", "mac": "64:51:7e:68:2e:9d"
    }
  },
  "wifi": {
    "status": "ok", "ip": "192.168.111.1", "netmask": "255.255.255.0", "proto": "static",
    "hostname": "beeclear", "mode": "ap", "ssid": "BeeClear",
    "status_info": { "aan": 1, "ip": "192.168.111.1", "mode": "AP", "wstatus": "up", "ssid": "BeeClear", "mac": "64:51:7e:68:2e:9c" }
  }
}"#;
    let network = serde_json::from_str::<NetworkInfo>(json).unwrap();
    assert_eq!(network.mac(), Some("64:51:7e:68:2e:9d"));
    assert_eq!(network.wifi.ssid.as_deref(), Some("BeeClear"));
    assert_eq!(network.wifi.status_info.unwrap().wstatus, "up");
}

#[test]
fn test_device_status() {
    let json = r#"{ "p1": 0, "sdcard": 1, "sdcardFree": "99.9%", "sdcardTotal": "15.47 GB" }"#;
    assert_eq!(
        serde_json::from_str::<DeviceStatus>(json).unwrap(),
        DeviceStatus {
            p1: 0,
            sdcard: 1,
            sdcard_free: "99.9%".to_owned(),
            sdcard_total: "15.47 GB".to_owned(),
        }
    );
}
