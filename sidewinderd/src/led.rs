//! Keyboard LEDs
//!
//! Every LED of a keyboard lives in one report byte, either a feature report
//! read/modified/written through the HID transport or a byte inside a raw
//! output report. The [`IndicatorGroup`] owns the transport handle, the
//! indicator masks and the output report buffers. A [`Led`] only knows its own
//! bits and where they live, so no LED ever holds a stale copy of the byte.

use sidewinderd_common::tracing;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::DriverResult;
use crate::hid::HidTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedType {
    /// Mutually exclusive with the other profile LEDs
    Profile,
    /// Never cleared when a profile LED turns on
    Indicator,
    /// Touches only its own bits
    Common,
}

/// Where an LED's byte lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportTarget {
    Feature(u8),
    /// Slot of an output report buffer owned by the group
    Output(usize),
}

struct OutputReport {
    buffer: Vec<u8>,
    position: usize,
}

/// Per-keyboard LED state shared by all of its [`Led`]s
pub struct IndicatorGroup {
    hid: Arc<dyn HidTransport>,
    masks: HashMap<ReportTarget, u8>,
    output_reports: Vec<OutputReport>,
}

impl IndicatorGroup {
    pub fn new(hid: Arc<dyn HidTransport>) -> Self {
        Self {
            hid,
            masks: HashMap::new(),
            output_reports: Vec::new(),
        }
    }

    /// Bits of indicator LEDs living in `target`
    pub fn indicator_mask(&self, target: ReportTarget) -> u8 {
        self.masks.get(&target).copied().unwrap_or(0)
    }

    fn add_indicator(&mut self, target: ReportTarget, bits: u8) {
        *self.masks.entry(target).or_insert(0) |= bits;
    }

    fn remove_indicator(&mut self, target: ReportTarget, bits: u8) {
        if let Some(mask) = self.masks.get_mut(&target) {
            *mask &= !bits;
        }
    }

    /// Slot for an output report template, shared between LEDs using the same one
    fn output_slot(&mut self, template: &[u8], position: usize, size: usize) -> usize {
        let mut buffer = vec![0u8; size.max(position + 1)];
        let len = template.len().min(buffer.len());
        buffer[..len].copy_from_slice(&template[..len]);
        buffer[position] = 0;

        if let Some(slot) = self
            .output_reports
            .iter()
            .position(|report| report.position == position && report.buffer == buffer)
        {
            return slot;
        }

        self.output_reports.push(OutputReport { buffer, position });
        self.output_reports.len() - 1
    }

    fn read(&self, target: ReportTarget) -> DriverResult<u8> {
        match target {
            ReportTarget::Feature(report_id) => self.hid.get_feature_report(report_id),
            ReportTarget::Output(slot) => Ok(self
                .output_reports
                .get(slot)
                .map(|report| report.buffer[report.position])
                .unwrap_or(0)),
        }
    }

    fn write(&mut self, target: ReportTarget, value: u8) -> DriverResult<()> {
        match target {
            ReportTarget::Feature(report_id) => self.hid.set_feature_report(report_id, value),
            ReportTarget::Output(slot) => match self.output_reports.get_mut(slot) {
                Some(report) => {
                    report.buffer[report.position] = value;
                    self.hid.write_data(&report.buffer)
                }
                None => Ok(()),
            },
        }
    }

    /// Replace the LED byte if it differs. Returns whether a write was issued.
    fn update(&mut self, target: ReportTarget, current: u8, next: u8) -> DriverResult<bool> {
        if next == current {
            return Ok(false);
        }

        debug!("LED {:?}: {:#04x} -> {:#04x}", target, current, next);
        self.write(target, next)?;
        Ok(true)
    }
}

/// One controllable LED
#[derive(Debug, Clone)]
pub struct Led {
    target: ReportTarget,
    bits: u8,
    kind: LedType,
    blink: Option<u8>,
}

impl Led {
    /// LED driven through feature report `report_id`
    pub fn new(group: &mut IndicatorGroup, report_id: u8, bits: u8, kind: LedType) -> Self {
        let target = ReportTarget::Feature(report_id);
        if kind == LedType::Indicator {
            group.add_indicator(target, bits);
        }

        Self { target, bits, kind, blink: None }
    }

    pub fn kind(&self) -> LedType {
        self.kind
    }

    pub fn target(&self) -> ReportTarget {
        self.target
    }

    /// Use a hardware blink code instead of a solid light for `blink()`
    pub fn register_blink(&mut self, code: u8) {
        self.blink = Some(code);
    }

    /// Drive this LED through byte `position` of a `size`-byte output report
    /// built from `template`
    pub fn register_report_write(
        &mut self,
        group: &mut IndicatorGroup,
        template: &[u8],
        position: usize,
        size: usize,
    ) {
        let target = ReportTarget::Output(group.output_slot(template, position, size));
        if self.kind == LedType::Indicator {
            group.remove_indicator(self.target, self.bits);
            group.add_indicator(target, self.bits);
        }
        self.target = target;
    }

    pub fn on(&self, group: &mut IndicatorGroup) -> DriverResult<bool> {
        let current = group.read(self.target)?;
        let base = match self.kind {
            LedType::Profile => current & group.indicator_mask(self.target),
            LedType::Indicator | LedType::Common => current,
        };

        group.update(self.target, current, base | self.bits)
    }

    pub fn off(&self, group: &mut IndicatorGroup) -> DriverResult<bool> {
        let current = group.read(self.target)?;
        group.update(self.target, current, current & !self.bits)
    }

    pub fn blink(&self, group: &mut IndicatorGroup) -> DriverResult<bool> {
        match self.blink {
            Some(code) => {
                let current = group.read(self.target)?;
                group.update(self.target, current, (current & !self.bits) | code)
            }
            // no software blink, stay solid
            None => self.on(group),
        }
    }

    pub fn is_on(&self, group: &IndicatorGroup) -> DriverResult<bool> {
        Ok(group.read(self.target)? & self.bits != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHid;

    const REPORT: u8 = 7;

    fn group_with(hid: &Arc<FakeHid>) -> IndicatorGroup {
        IndicatorGroup::new(hid.clone())
    }

    #[test]
    fn test_on_twice_writes_once() {
        let hid = FakeHid::new();
        let mut group = group_with(&hid);
        let led = Led::new(&mut group, REPORT, 0x04, LedType::Profile);

        assert!(led.on(&mut group).unwrap());
        assert!(!led.on(&mut group).unwrap());

        assert_eq!(hid.feature_writes(), vec![vec![REPORT, 0x04]]);
    }

    #[test]
    fn test_profile_leds_keep_indicators() {
        let hid = FakeHid::new();
        let mut group = group_with(&hid);
        let p1 = Led::new(&mut group, REPORT, 0x04, LedType::Profile);
        let p2 = Led::new(&mut group, REPORT, 0x08, LedType::Profile);
        let p3 = Led::new(&mut group, REPORT, 0x10, LedType::Profile);
        let auto = Led::new(&mut group, REPORT, 0x02, LedType::Indicator);
        let record = Led::new(&mut group, REPORT, 0x60, LedType::Indicator);

        assert_eq!(group.indicator_mask(ReportTarget::Feature(REPORT)), 0x62);

        auto.on(&mut group).unwrap();
        record.on(&mut group).unwrap();

        for led in [&p1, &p2, &p3, &p2, &p1, &p3] {
            led.on(&mut group).unwrap();
            let value = hid.feature(REPORT);
            assert_eq!(value & 0x62, 0x62);
            assert_eq!((value & 0x1c).count_ones(), 1);
            assert!(led.is_on(&group).unwrap());
        }
    }

    #[test]
    fn test_common_led_leaves_other_bits() {
        let hid = FakeHid::new();
        hid.set_feature(REPORT, 0x0c);
        let mut group = group_with(&hid);
        let common = Led::new(&mut group, REPORT, 0x01, LedType::Common);

        common.on(&mut group).unwrap();
        assert_eq!(hid.feature(REPORT), 0x0d);

        common.off(&mut group).unwrap();
        assert_eq!(hid.feature(REPORT), 0x0c);
    }

    #[test]
    fn test_off_clears_only_own_bits() {
        let hid = FakeHid::new();
        hid.set_feature(REPORT, 0x66);
        let mut group = group_with(&hid);
        let record = Led::new(&mut group, REPORT, 0x60, LedType::Indicator);

        assert!(record.off(&mut group).unwrap());
        assert_eq!(hid.feature(REPORT), 0x06);
        assert!(!record.off(&mut group).unwrap());
    }

    #[test]
    fn test_blink_uses_hardware_code() {
        let hid = FakeHid::new();
        let mut group = group_with(&hid);
        let mut record = Led::new(&mut group, REPORT, 0x60, LedType::Indicator);
        record.register_blink(0x40);

        record.on(&mut group).unwrap();
        record.blink(&mut group).unwrap();
        assert_eq!(hid.feature(REPORT), 0x40);
    }

    #[test]
    fn test_blink_without_code_is_solid() {
        let hid = FakeHid::new();
        let mut group = group_with(&hid);
        let record = Led::new(&mut group, 6, 0x08, LedType::Indicator);

        record.blink(&mut group).unwrap();
        assert_eq!(hid.feature(6), 0x08);
    }

    #[test]
    fn test_report_write_leds_share_buffer() {
        let hid = FakeHid::new();
        let mut group = group_with(&hid);
        let template = [0x11, 0xff, 0x0b, 0x1c];

        let mut m1 = Led::new(&mut group, 0, 0x01, LedType::Profile);
        let mut m2 = Led::new(&mut group, 0, 0x02, LedType::Profile);
        let mut mr = Led::new(&mut group, 0, 0x01, LedType::Indicator);
        m1.register_report_write(&mut group, &template, 4, 20);
        m2.register_report_write(&mut group, &template, 4, 20);
        mr.register_report_write(&mut group, &[0x11, 0xff, 0x0c, 0x0c], 4, 20);

        assert_eq!(m1.target(), m2.target());
        assert_ne!(m1.target(), mr.target());
        assert_eq!(group.indicator_mask(ReportTarget::Feature(0)), 0);
        assert_eq!(group.indicator_mask(mr.target()), 0x01);

        m1.on(&mut group).unwrap();
        mr.on(&mut group).unwrap();
        m2.on(&mut group).unwrap();
        assert!(!m2.on(&mut group).unwrap());

        let writes = hid.output_writes();
        assert_eq!(writes.len(), 3);
        assert!(writes.iter().all(|w| w.len() == 20));
        assert_eq!(&writes[0][..5], &[0x11, 0xff, 0x0b, 0x1c, 0x01]);
        assert_eq!(&writes[1][..5], &[0x11, 0xff, 0x0c, 0x0c, 0x01]);
        assert_eq!(&writes[2][..5], &[0x11, 0xff, 0x0b, 0x1c, 0x02]);
        assert!(hid.feature_writes().is_empty());
    }
}
