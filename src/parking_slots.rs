use anyhow::Context;
use mongodb::Client;
use serde::{Deserialize, Serialize};
use std::{fmt, io::Write};
use tracing::{info, warn};

pub const DEFAULT_MOTORBIKE_SLOTS: usize = 200;
pub const DEFAULT_CAR_SLOTS: usize = 50;
pub const DEFAULT_MONGODB_URI: &str = "mongodb://localhost:27017/";
pub const DEFAULT_DATABASE: &str = "SmartParkingDb";
pub const SLOTS_COLLECTION: &str = "ParkingSlots";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotType {
    Motorbike,
    Car,
}

impl SlotType {
    fn prefix(self) -> char {
        match self {
            SlotType::Motorbike => 'M',
            SlotType::Car => 'C',
        }
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotType::Motorbike => write!(f, "MOTORBIKE"),
            SlotType::Car => write!(f, "CAR"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Available,
    Occupied,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParkingSlot {
    pub slot_id: String,
    #[serde(rename = "type")]
    pub slot_type: SlotType,
    pub status: SlotStatus,
    pub current_vehicle_id: Option<String>,
}

impl ParkingSlot {
    pub fn available(slot_type: SlotType, number: usize) -> Self {
        Self {
            slot_id: format!("{}{:03}", slot_type.prefix(), number),
            slot_type,
            status: SlotStatus::Available,
            current_vehicle_id: None,
        }
    }
}

/// Motorbike slots first, then car slots, numbered from 1.
pub fn generate_slots(motorbikes: usize, cars: usize) -> Vec<ParkingSlot> {
    let motorbike_slots = (1..=motorbikes).map(|n| ParkingSlot::available(SlotType::Motorbike, n));
    let car_slots = (1..=cars).map(|n| ParkingSlot::available(SlotType::Car, n));
    motorbike_slots.chain(car_slots).collect()
}

/// Writes one JSON document per line, returns the number written.
pub fn write_ndjson(slots: &[ParkingSlot], mut writer: impl Write) -> anyhow::Result<usize> {
    for slot in slots {
        serde_json::to_writer(&mut writer, slot)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(slots.len())
}

/// Drops `database` and inserts `slots` into its `ParkingSlots` collection,
/// motorbike slots first.
pub async fn seed_mongodb(
    uri: &str,
    database: &str,
    slots: &[ParkingSlot],
) -> anyhow::Result<SlotSummary> {
    let client = Client::with_uri_str(uri)
        .await
        .with_context(|| format!("Could not connect to MongoDB at {uri}"))?;
    info!(uri, "Connected to MongoDB");

    warn!(database, "Dropping the existing database");
    client
        .database(database)
        .drop()
        .await
        .with_context(|| format!("Failed to drop database {database}"))?;

    let collection = client
        .database(database)
        .collection::<ParkingSlot>(SLOTS_COLLECTION);
    for slot_type in [SlotType::Motorbike, SlotType::Car] {
        let batch: Vec<&ParkingSlot> = slots
            .iter()
            .filter(|slot| slot.slot_type == slot_type)
            .collect();
        if batch.is_empty() {
            continue;
        }
        let inserted = collection
            .insert_many(batch)
            .await
            .with_context(|| format!("Failed to insert {slot_type} slots"))?;
        info!(%slot_type, count = inserted.inserted_ids.len(), "Created parking slots");
    }

    Ok(summarize(slots))
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SlotSummary {
    pub motorbikes: usize,
    pub cars: usize,
    pub available: usize,
}

pub fn summarize(slots: &[ParkingSlot]) -> SlotSummary {
    slots.iter().fold(SlotSummary::default(), |mut summary, slot| {
        match slot.slot_type {
            SlotType::Motorbike => summary.motorbikes += 1,
            SlotType::Car => summary.cars += 1,
        }
        if slot.status == SlotStatus::Available {
            summary.available += 1;
        }
        summary
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_has_zero_padded_ids() {
        let slots = generate_slots(DEFAULT_MOTORBIKE_SLOTS, DEFAULT_CAR_SLOTS);
        assert_eq!(slots.len(), 250);
        assert_eq!(slots[0].slot_id, "M001");
        assert_eq!(slots[199].slot_id, "M200");
        assert_eq!(slots[200].slot_id, "C001");
        assert_eq!(slots[249].slot_id, "C050");
        assert_eq!(
            summarize(&slots),
            SlotSummary {
                motorbikes: 200,
                cars: 50,
                available: 250
            }
        );
    }

    #[test]
    fn documents_use_collection_field_names() {
        let value = serde_json::to_value(ParkingSlot::available(SlotType::Car, 7)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "slotId": "C007",
                "type": "CAR",
                "status": "AVAILABLE",
                "currentVehicleId": null
            })
        );
    }

    #[test]
    fn ndjson_writes_one_document_per_line() {
        let slots = generate_slots(2, 1);
        let mut out = Vec::new();
        assert_eq!(write_ndjson(&slots, &mut out).unwrap(), 3);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: ParkingSlot = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last, ParkingSlot::available(SlotType::Car, 1));
    }

    #[tokio::test]
    async fn seeding_rejects_a_malformed_uri() {
        let slots = generate_slots(1, 1);
        let err = seed_mongodb("not-a-mongodb-uri", DEFAULT_DATABASE, &slots)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Could not connect to MongoDB"));
    }

    #[test]
    fn empty_layout_writes_nothing() {
        let mut out = Vec::new();
        assert_eq!(write_ndjson(&generate_slots(0, 0), &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }
}
