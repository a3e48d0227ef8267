use std::io::Write;

use serde_json::json;

use epgkeeper_core::database::EpgDatabase;
use epgkeeper_core::database::EpgRecord;
use epgkeeper_core::database::SqliteDatabase;
use epgkeeper_core::error::Error;
use epgkeeper_core::models::TableId;
use epgkeeper_core::*;

#[derive(clap::Args)]
pub struct CommandLine {
    /// Dump only the table with the id.
    #[arg(short, long)]
    table: Option<i32>,

    /// Omit tags.
    #[arg(long)]
    tables_only: bool,
}

pub fn main(config: &config::Config, cl: &CommandLine) {
    if config.database.path.is_none() {
        tracing::warn!("No database file specified, nothing to dump");
        return;
    }
    let database = SqliteDatabase::new(config.database.path.clone());
    if let Err(err) = dump(&database, cl, &mut std::io::stdout().lock()) {
        tracing::error!(%err, "Failed to dump");
    }
    database.close();
}

fn dump<W: Write>(database: &dyn EpgDatabase, cl: &CommandLine, out: &mut W) -> Result<(), Error> {
    database.open()?;
    let filter = cl.table.map(TableId::from);
    let records: Vec<_> = database
        .get_all()?
        .into_iter()
        .filter(|record| filter.is_none_or(|id| record.id == id))
        .collect();
    if filter.is_some() && records.is_empty() {
        return Err(Error::TableNotFound);
    }
    for record in records {
        let tags = if cl.tables_only {
            vec![]
        } else {
            database.load_tags(record.id)?
        };
        writeln!(out, "{}", to_json(&record, &tags))?;
    }
    Ok(())
}

fn to_json(record: &EpgRecord, tags: &[models::EpgTag]) -> serde_json::Value {
    json!({
        "id": record.id,
        "name": record.name,
        "scraperName": record.scraper_name,
        "channel": record.channel,
        "lastScan": record.last_scan,
        "tags": tags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use chrono::Utc;
    use epgkeeper_core::models::ChannelKey;
    use epgkeeper_core::models::EpgTag;

    #[test]
    fn test_dump() {
        let database = SqliteDatabase::in_memory();
        database.open().unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for id in 1..=2 {
            let channel = ChannelKey::from((1, 100 + id));
            let record = EpgRecord {
                id: id.into(),
                name: format!("ch{}", 100 + id),
                scraper_name: "client".to_string(),
                channel: Some(channel),
                last_scan: None,
            };
            let tag = EpgTag::new(1.into(), channel, start, start + chrono::Duration::minutes(30));
            database.persist(&record, &[tag]).unwrap();
        }

        let cl = CommandLine {
            table: Some(2),
            tables_only: false,
        };
        let mut out = vec![];
        dump(&database, &cl, &mut out).unwrap();
        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["id"], 2);
        assert_eq!(lines[0]["name"], "ch102");
        assert_eq!(lines[0]["channel"]["channelUid"], 102);
        assert_eq!(lines[0]["tags"].as_array().map(Vec::len), Some(1));

        let cl = CommandLine {
            table: None,
            tables_only: true,
        };
        let mut out = vec![];
        dump(&database, &cl, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(out.lines().all(|line| line.contains(r#""tags":[]"#)));

        let cl = CommandLine {
            table: Some(3),
            tables_only: false,
        };
        let result = dump(&database, &cl, &mut Vec::<u8>::new());
        assert_matches!(result, Err(Error::TableNotFound));
    }
}
