use super::envelope::{attr, AttributeValue, Envelope};
use super::subscriber::Position;
use crate::error::{RelayError, RelayResult};
use std::fmt;
use std::str::FromStr;

/// # Occupancy Event
///
/// One report taken off the shared inbound queue. Built from an `Envelope`
/// through `Event::from_envelope`, which is the single gate that rejects
/// malformed reports (missing or unparsable attributes, negative radius or
/// counts) before they reach the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Publisher / structure identifier.
    pub source_id: String,
    pub topic: String,
    /// Newly reported positive cases since the last report.
    pub positive_count: u64,
    pub people_count: u64,
    /// Surface in square metres used for the density ratio.
    pub area: u64,
    pub position: Position,
    /// 0 means topic-wide broadcast; otherwise half-width of the delivery box.
    pub radius: u32,
    pub body: String,
}

impl Event {
    /// Parses a wire envelope. Either `String` or `Number` data types are
    /// accepted as long as the value itself parses.
    pub fn from_envelope(envelope: &Envelope) -> RelayResult<Self> {
        let source_id = required(envelope, attr::ID)?.to_string();
        let topic = required(envelope, attr::TOPIC)?.to_string();

        let positive_count = non_negative(envelope, attr::POSITIVE)?;
        let people_count = non_negative(envelope, attr::PEOPLE_NUM)?;
        let area = non_negative(envelope, attr::MQ)?;
        let x: i64 = number(envelope, attr::POSITION_X)?;
        let y: i64 = number(envelope, attr::POSITION_Y)?;

        let raw_radius: i64 = number(envelope, attr::RADIUS)?;
        if raw_radius < 0 {
            return Err(RelayError::MalformedEvent(format!(
                "negative radius {} from source {}",
                raw_radius, source_id
            )));
        }
        let radius = u32::try_from(raw_radius).map_err(|_| {
            RelayError::MalformedEvent(format!("radius {} out of range", raw_radius))
        })?;

        Ok(Self {
            source_id,
            topic,
            positive_count,
            people_count,
            area,
            position: Position::new(x, y),
            radius,
            body: envelope.body.clone(),
        })
    }

    /// The envelope forwarded to every recipient: all attributes, body verbatim.
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.body.clone())
            .with_attribute(attr::ID, AttributeValue::string(&self.source_id))
            .with_attribute(attr::TOPIC, AttributeValue::string(&self.topic))
            .with_attribute(attr::POSITIVE, AttributeValue::number(self.positive_count))
            .with_attribute(attr::PEOPLE_NUM, AttributeValue::number(self.people_count))
            .with_attribute(attr::MQ, AttributeValue::number(self.area))
            .with_attribute(attr::POSITION_X, AttributeValue::number(self.position.x))
            .with_attribute(attr::POSITION_Y, AttributeValue::number(self.position.y))
            .with_attribute(attr::RADIUS, AttributeValue::number(self.radius))
    }

    /// People per square metre. A crowded zero-area report is infinitely
    /// dense; an empty one is NaN and never compares above a threshold.
    pub fn density(&self) -> f64 {
        self.people_count as f64 / self.area as f64
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[source {}; {} m2] \"{}\" | people {} (positive {}) | topic \"{}\" | {} r={}",
            self.source_id,
            self.area,
            self.body,
            self.people_count,
            self.positive_count,
            self.topic,
            self.position,
            self.radius
        )
    }
}

fn required<'a>(envelope: &'a Envelope, name: &str) -> RelayResult<&'a str> {
    envelope
        .attribute(name)
        .ok_or_else(|| RelayError::MalformedEvent(format!("missing attribute {}", name)))
}

fn number<T: FromStr>(envelope: &Envelope, name: &str) -> RelayResult<T> {
    let raw = required(envelope, name)?;
    raw.trim().parse::<T>().map_err(|_| {
        RelayError::MalformedEvent(format!("attribute {} is not a valid number: {:?}", name, raw))
    })
}

fn non_negative(envelope: &Envelope, name: &str) -> RelayResult<u64> {
    let value: i64 = number(envelope, name)?;
    u64::try_from(value)
        .map_err(|_| RelayError::MalformedEvent(format!("attribute {} is negative: {}", name, value)))
}
