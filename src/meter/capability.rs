// デバイスの機能(capability)
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::meter::MeterState;
use crate::session::DeviceSetting;
use std::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Phase {
    L1,
    L2,
    L3,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::L1, Phase::L2, Phase::L3];

    fn index(self) -> usize {
        match self {
            Phase::L1 => 0,
            Phase::L2 => 1,
            Phase::L3 => 2,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Capability {
    MeasurePower,
    MeterPower,
    MeasureGas,
    MeterGas,
    MeterOffPeak,
    MeterPowerPeak,
    MeterPowerOffPeak,
    MeterPowerProducedPeak,
    MeterPowerProducedOffPeak,
    MeterPowerImported,
    MeterPowerExported,
    PhasePower(Phase),
    PhaseCurrent(Phase),
    PhaseVoltage(Phase),
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        use Capability::*;
        match self {
            MeasurePower => "measure_power",
            MeterPower => "meter_power",
            MeasureGas => "measure_gas",
            MeterGas => "meter_gas",
            MeterOffPeak => "meter_offPeak",
            MeterPowerPeak => "meter_power.peak",
            MeterPowerOffPeak => "meter_power.offPeak",
            MeterPowerProducedPeak => "meter_power.producedPeak",
            MeterPowerProducedOffPeak => "meter_power.producedOffPeak",
            MeterPowerImported => "meter_power.imported",
            MeterPowerExported => "meter_power.exported",
            PhasePower(Phase::L1) => "measure_power.l1",
            PhasePower(Phase::L2) => "measure_power.l2",
            PhasePower(Phase::L3) => "measure_power.l3",
            PhaseCurrent(Phase::L1) => "measure_current.l1",
            PhaseCurrent(Phase::L2) => "measure_current.l2",
            PhaseCurrent(Phase::L3) => "measure_current.l3",
            PhaseVoltage(Phase::L1) => "measure_voltage.l1",
            PhaseVoltage(Phase::L2) => "measure_voltage.l2",
            PhaseVoltage(Phase::L3) => "measure_voltage.l3",
        }
    }

    /// 機器の設定から使える機能を決める
    pub fn for_device(setting: &DeviceSetting) -> Vec<Capability> {
        use Capability::*;
        let mut capabilities = vec![MeasurePower, MeterPower, MeterPowerImported];
        if setting.dubbeltariefmeter {
            capabilities.extend([MeterOffPeak, MeterPowerPeak, MeterPowerOffPeak]);
        }
        if setting.levering {
            capabilities.extend([MeterPowerExported, MeterPowerProducedPeak]);
        }
        if setting.dubbeltariefmeter && setting.levering {
            capabilities.push(MeterPowerProducedOffPeak);
        }
        if setting.showgas {
            capabilities.extend([MeasureGas, MeterGas]);
        }
        if setting.driefase_meting {
            for phase in Phase::ALL {
                capabilities.extend([PhasePower(phase), PhaseCurrent(phase), PhaseVoltage(phase)]);
            }
        }
        capabilities
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum CapabilityValue {
    Number(f64),
    Bool(bool),
}

impl fmt::Display for CapabilityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityValue::Number(v) => write!(f, "{}", v),
            CapabilityValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl MeterState {
    /// 観測済みの値だけを返す
    pub fn capability_values(&self) -> Vec<(Capability, CapabilityValue)> {
        use Capability::*;
        use CapabilityValue::*;
        let numbers = [
            (MeasurePower, self.measure_power),
            (MeterPower, self.meter_power),
            (MeasureGas, Some(self.measure_gas)),
            (MeterGas, self.meter_gas),
            (MeterPowerPeak, self.meter_power_peak),
            (MeterPowerOffPeak, self.meter_power_off_peak),
            (MeterPowerProducedPeak, self.meter_power_peak_produced),
            (MeterPowerProducedOffPeak, self.meter_power_off_peak_produced),
            (MeterPowerImported, self.meter_power_imported),
            (MeterPowerExported, self.meter_power_exported),
        ];
        let mut values = numbers
            .into_iter()
            .filter_map(|(capability, value)| value.map(|v| (capability, Number(v))))
            .collect::<Vec<_>>();
        if let Some(off_peak) = self.off_peak {
            values.push((MeterOffPeak, Bool(off_peak)));
        }
        for phase in Phase::ALL {
            let i = phase.index();
            let per_phase = [
                (PhasePower(phase), self.phases.power[i]),
                (PhaseCurrent(phase), self.phases.current[i]),
                (PhaseVoltage(phase), self.phases.voltage[i]),
            ];
            values.extend(
                per_phase
                    .into_iter()
                    .filter_map(|(capability, value)| value.map(|v| (capability, Number(v)))),
            );
        }
        values
    }
}

#[test]
fn test_for_device() {
    let setting = DeviceSetting {
        dubbeltariefmeter: true,
        levering: false,
        showgas: true,
        ..Default::default()
    };
    let names = Capability::for_device(&setting)
        .iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![
            "measure_power",
            "meter_power",
            "meter_power.imported",
            "meter_offPeak",
            "meter_power.peak",
            "meter_power.offPeak",
            "measure_gas",
            "meter_gas",
        ]
    );
}

#[test]
fn test_capability_values() {
    let mut state = MeterState {
        measure_power: Some(812.0),
        meter_power: Some(6853.734),
        off_peak: Some(false),
        ..Default::default()
    };
    state.phases.voltage[1] = Some(230.5);
    let values = state.capability_values();
    assert_eq!(
        values,
        vec![
            (Capability::MeasurePower, CapabilityValue::Number(812.0)),
            (Capability::MeterPower, CapabilityValue::Number(6853.734)),
            (Capability::MeasureGas, CapabilityValue::Number(0.0)),
            (Capability::MeterOffPeak, CapabilityValue::Bool(false)),
            (
                Capability::PhaseVoltage(Phase::L2),
                CapabilityValue::Number(230.5)
            ),
        ]
    );
    assert_eq!(values[4].0.to_string(), "measure_voltage.l2");
    assert_eq!(values[3].1.to_string(), "false");
}
