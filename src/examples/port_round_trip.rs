//! Port File Round Trip Example
//!
//! Parses a small bulk-metadata document, resolves the entities and
//! relations it describes, and renders it back out. No server needed.
//!
//! Run with: cargo run --example port_round_trip

use icat_core::Document;

const PORT_FILE: &str = r#"# A small catalog
1.0

Facility ( name:0, daysUntilRelease:1)
"Demo facility", 90

InvestigationType (facility(name:0), name:1)
"Demo facility", "calibration"

Investigation(facility(name:0), name:1, visitId:2, type(facility(name:0), name:3), title:4)
"Demo facility", "expt1", "one", "calibration", "A demo investigation"
"#;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let doc = Document::parse(PORT_FILE)?;
    println!(
        "Parsed format version {}.{} with {} blocks",
        doc.major,
        doc.minor,
        doc.blocks.len()
    );

    for entity in doc.resolve()? {
        println!("#{} {}", entity.id, entity.entity_type);
        for (field, value) in &entity.fields {
            println!("    {field} = {value}");
        }
        for (field, target) in &entity.relations {
            println!("    {field} -> #{target}");
        }
    }

    println!("\nRendered back out:\n{doc}");
    Ok(())
}
