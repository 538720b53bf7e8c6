// 計測値(/bc_current)
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::session::SessionError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// 型の合わない値は無かったことにする
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// 読めないガスメーター計測値は空にする
fn lenient_gas<'de, D>(deserializer: D) -> Result<Vec<GasSample>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// ガスメーター計測値
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct GasSample {
    #[serde(deserialize_with = "lenient")]
    pub slot: Option<u32>,
    /// m3 × 1000
    #[serde(deserialize_with = "lenient")]
    pub val: Option<f64>,
    /// unix time
    #[serde(deserialize_with = "lenient")]
    pub time: Option<i64>,
}

/// 機器が返す計測値そのまま
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct RawSample {
    /// 計測時刻 unix time
    #[serde(deserialize_with = "lenient")]
    pub d: Option<i64>,
    #[serde(deserialize_with = "lenient")]
    pub ed: Option<i64>,
    /// 2 = 昼間料金
    #[serde(rename = "tariefStatus", deserialize_with = "lenient")]
    pub tarief_status: Option<i64>,
    /// 買電(夜間) Wh
    #[serde(deserialize_with = "lenient")]
    pub ul: Option<f64>,
    /// 買電(昼間) Wh
    #[serde(deserialize_with = "lenient")]
    pub uh: Option<f64>,
    /// 売電(夜間) Wh
    #[serde(deserialize_with = "lenient")]
    pub gl: Option<f64>,
    /// 売電(昼間) Wh
    #[serde(deserialize_with = "lenient")]
    pub gh: Option<f64>,
    /// 瞬時電力(買電) W
    #[serde(deserialize_with = "lenient")]
    pub u: Option<f64>,
    /// 瞬時電力(売電) W
    #[serde(deserialize_with = "lenient")]
    pub g: Option<f64>,
    #[serde(deserialize_with = "lenient_gas")]
    pub gas: Vec<GasSample>,
    // 相ごとの電力(W), 電流(A), 電圧(V)
    #[serde(deserialize_with = "lenient")]
    pub l1: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub l2: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub l3: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub i1: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub i2: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub i3: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub v1: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub v2: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub v3: Option<f64>,
}

/// 相ごとの計測値
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Debug, Default)]
#[serde(default)]
pub struct Phases {
    pub power: [Option<f64>; 3],
    pub current: [Option<f64>; 3],
    pub voltage: [Option<f64>; 3],
}

impl Phases {
    /// 新しい値がなければ前回値を使う
    pub fn or(&self, last: &Phases) -> Phases {
        let pick = |now: &[Option<f64>; 3], last: &[Option<f64>; 3]| {
            [now[0].or(last[0]), now[1].or(last[1]), now[2].or(last[2])]
        };
        Phases {
            power: pick(&self.power, &last.power),
            current: pick(&self.current, &last.current),
            voltage: pick(&self.voltage, &last.voltage),
        }
    }
}

/// 短縮形の計測値
/// 電力量はkWh, 電力はW, ガスはm3
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default)]
pub struct ShortReading {
    /// 瞬時電力(買電 - 売電)
    pub pwr: Option<f64>,
    /// 正味の積算電力量
    pub net: Option<f64>,
    /// 買電(夜間)
    pub p1: Option<f64>,
    /// 買電(昼間)
    pub p2: Option<f64>,
    /// 売電(夜間)
    pub n1: Option<f64>,
    /// 売電(昼間)
    pub n2: Option<f64>,
    pub tm: Option<i64>,
    pub gas: Option<f64>,
    pub gtm: Option<i64>,
    pub phases: Phases,
}

/// 小数点以下digits桁に丸める
pub fn round_to(value: f64, digits: i32) -> f64 {
    let k = 10f64.powi(digits);
    (value * k).round() / k
}

impl TryFrom<&RawSample> for ShortReading {
    type Error = SessionError;

    fn try_from(raw: &RawSample) -> Result<Self, Self::Error> {
        let mut reading = ShortReading::default();

        // 電力は全部そろっているときだけ
        if let (Some(u), Some(g), Some(ul), Some(uh), Some(gl), Some(gh), Some(d)) =
            (raw.u, raw.g, raw.ul, raw.uh, raw.gl, raw.gh, raw.d)
        {
            let (p1, p2, n1, n2) = (ul / 1000.0, uh / 1000.0, gl / 1000.0, gh / 1000.0);
            reading.pwr = Some(u - g);
            reading.net = Some(round_to(p1 + p2 - n1 - n2, 4));
            reading.p1 = Some(p1);
            reading.p2 = Some(p2);
            reading.n1 = Some(n1);
            reading.n2 = Some(n2);
            reading.tm = Some(d);
        }

        // ガスは先頭のスロット
        if let Some(GasSample {
            val: Some(val),
            time: Some(time),
            ..
        }) = raw.gas.first()
        {
            reading.gas = Some(val / 1000.0);
            reading.gtm = Some(*time);
        }

        reading.phases = Phases {
            power: [raw.l1, raw.l2, raw.l3],
            current: [raw.i1, raw.i2, raw.i3],
            voltage: [raw.v1, raw.v2, raw.v3],
        };

        if reading.tm.is_none() && reading.gtm.is_none() {
            return Err(SessionError::ReadingParseError);
        }
        Ok(reading)
    }
}

#[test]
fn test_short_reading() {
    let json = r#"{
  "d": 1600798993,
  "ed": 1600798989,
  "tariefStatus": 2,
  "ul": 12637314,
  "uh": 8553028,
  "gl": 4288455,
  "gh": 10048153,
  "verbruik0": 814,
  "leveren0": 0,
  "u": 812,
  "g": 0,
  "gas": [ { "slot": 0, "val": 6399475, "time": 1600797600 } ],
  "setting": { "landcode": "NL" }
}"#;
    let raw = serde_json::from_str::<RawSample>(json).unwrap();
    let reading = ShortReading::try_from(&raw).unwrap();
    assert_eq!(reading.pwr, Some(812.0));
    assert_eq!(reading.net, Some(6853.734));
    assert_eq!(reading.p1, Some(12637.314));
    assert_eq!(reading.p2, Some(8553.028));
    assert_eq!(reading.n1, Some(4288.455));
    assert_eq!(reading.n2, Some(10048.153));
    assert_eq!(reading.tm, Some(1600798993));
    assert_eq!(reading.gas, Some(6399.475));
    assert_eq!(reading.gtm, Some(1600797600));
    assert_eq!(reading.phases, Phases::default());
}

#[test]
fn test_short_reading_gas_only() {
    let json = r#"{ "gas": [ { "slot": 0, "val": 2162690, "time": 1560178800 } ], "u": 646 }"#;
    let raw = serde_json::from_str::<RawSample>(json).unwrap();
    let reading = ShortReading::try_from(&raw).unwrap();
    assert_eq!(reading.pwr, None);
    assert_eq!(reading.tm, None);
    assert_eq!(reading.gas, Some(2162.69));
    assert_eq!(reading.gtm, Some(1560178800));
}

#[test]
fn test_short_reading_no_data() {
    let raw = serde_json::from_str::<RawSample>(r#"{ "info": "ok", "gas": [] }"#).unwrap();
    assert!(matches!(
        ShortReading::try_from(&raw),
        Err(SessionError::ReadingParseError)
    ));
}

#[test]
fn test_short_reading_phases() {
    let json = r#"{ "d": 1, "ul": 0, "uh": 0, "gl": 0, "gh": 0, "u": 300, "g": 0,
                    "l1": 100, "l2": 120, "l3": 80, "i1": 0.4, "v1": 231.2 }"#;
    let raw = serde_json::from_str::<RawSample>(json).unwrap();
    let reading = ShortReading::try_from(&raw).unwrap();
    assert_eq!(reading.phases.power, [Some(100.0), Some(120.0), Some(80.0)]);
    assert_eq!(reading.phases.current, [Some(0.4), None, None]);
    assert_eq!(reading.phases.voltage, [Some(231.2), None, None]);
}

#[test]
fn test_short_reading_odd_fields() {
    // 電力に関係ない項目の型違いで電力を失わない
    let json = r#"{ "d": 1600798993, "ed": "x", "tariefStatus": "2",
                    "ul": 12637314, "uh": 8553028, "gl": 4288455, "gh": 10048153,
                    "u": 812, "g": 0, "gas": null }"#;
    let raw = serde_json::from_str::<RawSample>(json).unwrap();
    assert_eq!(raw.tarief_status, None);
    assert!(raw.gas.is_empty());
    let reading = ShortReading::try_from(&raw).unwrap();
    assert_eq!(reading.tm, Some(1600798993));
    assert_eq!(reading.pwr, Some(812.0));
    assert_eq!(reading.gtm, None);

    let json = r#"{ "d": 1, "ul": 0, "uh": 0, "gl": 0, "gh": 0, "u": 5, "g": 0,
                    "gas": [ { "slot": -1, "val": 6399475, "time": 1600797600 } ] }"#;
    let raw = serde_json::from_str::<RawSample>(json).unwrap();
    assert_eq!(raw.gas[0].slot, None);
    let reading = ShortReading::try_from(&raw).unwrap();
    assert_eq!(reading.gas, Some(6399.475));
    assert_eq!(reading.gtm, Some(1600797600));
}

#[test]
fn test_short_reading_gas_without_power() {
    // 電力が読めなくてもガスだけで受け入れる
    let json = r#"{ "d": "soon", "u": "812", "gas": [ { "slot": 0, "val": 2162690, "time": 1560178800 } ] }"#;
    let raw = serde_json::from_str::<RawSample>(json).unwrap();
    let reading = ShortReading::try_from(&raw).unwrap();
    assert_eq!(reading.tm, None);
    assert_eq!(reading.pwr, None);
    assert_eq!(reading.gtm, Some(1560178800));
}
