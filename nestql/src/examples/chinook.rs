//! A slice of the Chinook music store: artists, albums, tracks, genres,
//! playlists and employees.
//!
//! Storage keys equal the API names except `tracks.unit_price`, stored as
//! `UnitPrice`.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::engine::Engine;
use crate::errors::EngineError;
use crate::registry::{Registry, RegistryBuilder};
use crate::store::{MemoryStore, Tables};
use crate::types::{
    CascadePolicy, FieldDescriptor, Identity, Record, RelationshipDescriptor, ResourceDescriptor, ValidationRule,
};

pub const PLAYLIST_TRACK: &str = "playlist_track";

pub fn artists() -> ResourceDescriptor {
    ResourceDescriptor::new("artists")
        .identity(["artist_id"])
        .field(FieldDescriptor::integer("artist_id").generated())
        .field(FieldDescriptor::string("name").validate(ValidationRule::Length {
            min: Some(1),
            max: Some(120),
        }))
        .relationship(
            RelationshipDescriptor::one_to_many("albums", "albums", &["artist_id"], &["artist_id"]).back_populates("artist"),
        )
}

pub fn albums() -> ResourceDescriptor {
    ResourceDescriptor::new("albums")
        .identity(["album_id"])
        .page_max_size(50)
        .field(FieldDescriptor::integer("album_id").generated())
        .field(FieldDescriptor::string("title").validate(ValidationRule::Length {
            min: Some(1),
            max: Some(160),
        }))
        .field(FieldDescriptor::integer("artist_id"))
        .relationship(
            RelationshipDescriptor::many_to_one("artist", "artists", &["artist_id"], &["artist_id"]).back_populates("albums"),
        )
        .relationship(
            RelationshipDescriptor::one_to_many("tracks", "tracks", &["album_id"], &["album_id"])
                .back_populates("album")
                .cascade(CascadePolicy::Detach),
        )
}

pub fn tracks() -> ResourceDescriptor {
    ResourceDescriptor::new("tracks")
        .identity(["track_id"])
        .page_max_size(100)
        .field(FieldDescriptor::integer("track_id").generated())
        .field(FieldDescriptor::string("name").validate(ValidationRule::Length {
            min: Some(1),
            max: Some(200),
        }))
        .field(FieldDescriptor::integer("album_id").optional())
        .field(FieldDescriptor::integer("genre_id").optional())
        .field(FieldDescriptor::string("composer").optional())
        .field(FieldDescriptor::integer("milliseconds").validate(ValidationRule::Range {
            min: Some(1.0),
            max: None,
        }))
        .field(FieldDescriptor::integer("bytes").optional())
        .field(
            FieldDescriptor::number("unit_price")
                .data_key("UnitPrice")
                .validate(ValidationRule::Range {
                    min: Some(0.0),
                    max: Some(100.0),
                }),
        )
        .relationship(
            RelationshipDescriptor::many_to_one("album", "albums", &["album_id"], &["album_id"]).back_populates("tracks"),
        )
        .relationship(
            RelationshipDescriptor::many_to_one("genre", "genres", &["genre_id"], &["genre_id"]).back_populates("tracks"),
        )
        .relationship(
            RelationshipDescriptor::many_to_many("playlists", "playlists", PLAYLIST_TRACK, "track_id", "playlist_id")
                .back_populates("tracks"),
        )
}

pub fn genres() -> ResourceDescriptor {
    ResourceDescriptor::new("genres")
        .identity(["genre_id"])
        .field(FieldDescriptor::integer("genre_id").generated())
        .field(FieldDescriptor::string("name"))
        .relationship(
            RelationshipDescriptor::one_to_many("tracks", "tracks", &["genre_id"], &["genre_id"]).back_populates("genre"),
        )
}

pub fn playlists() -> ResourceDescriptor {
    ResourceDescriptor::new("playlists")
        .identity(["playlist_id"])
        .field(FieldDescriptor::integer("playlist_id").generated())
        .field(FieldDescriptor::string("name"))
        .relationship(
            RelationshipDescriptor::many_to_many("tracks", "tracks", PLAYLIST_TRACK, "playlist_id", "track_id")
                .back_populates("playlists"),
        )
}

pub fn employees() -> ResourceDescriptor {
    ResourceDescriptor::new("employees")
        .identity(["employee_id"])
        .field(FieldDescriptor::integer("employee_id").generated())
        .field(FieldDescriptor::string("first_name"))
        .field(FieldDescriptor::string("last_name"))
        .field(FieldDescriptor::string("title").optional())
        .field(FieldDescriptor::string("email").optional().validate(ValidationRule::Email))
        .field(FieldDescriptor::datetime("hire_date").optional())
        .field(FieldDescriptor::integer("reports_to").optional())
        .field(FieldDescriptor::string("notes").optional().hidden())
        .relationship(
            RelationshipDescriptor::many_to_one("manager", "employees", &["reports_to"], &["employee_id"])
                .back_populates("reports"),
        )
        .relationship(
            RelationshipDescriptor::one_to_many("reports", "employees", &["employee_id"], &["reports_to"])
                .back_populates("manager"),
        )
}

pub fn resources() -> Vec<ResourceDescriptor> {
    vec![artists(), albums(), tracks(), genres(), playlists(), employees()]
}

/// Builder preloaded with every Chinook resource, ready for gates.
pub fn registry_builder() -> RegistryBuilder {
    Registry::builder().resources(resources())
}

pub fn registry() -> Result<Registry, EngineError> {
    registry_builder().build()
}

const ARTISTS: &[(i64, &str)] = &[
    (1, "AC/DC"),
    (2, "Accept"),
    (3, "Aerosmith"),
    (4, "Alanis Morissette"),
    (5, "Alice In Chains"),
    (6, "Antônio Carlos Jobim"),
    (7, "Apocalyptica"),
    (8, "Audioslave"),
];

const ALBUMS: &[(i64, &str, i64)] = &[
    (1, "For Those About To Rock We Salute You", 1),
    (2, "Balls to the Wall", 2),
    (3, "Restless and Wild", 2),
    (4, "Let There Be Rock", 1),
    (5, "Big Ones", 3),
    (6, "Jagged Little Pill", 4),
    (7, "Facelift", 5),
    (8, "Warner 25 Anos", 6),
    (9, "Plays Metallica By Four Cellos", 7),
    (10, "Audioslave", 8),
];

const GENRES: &[(i64, &str)] = &[(1, "Rock"), (2, "Jazz"), (3, "Metal"), (4, "Alternative & Punk"), (5, "Blues")];

/// (id, name, album, genre, composer, milliseconds)
type TrackSeed = (i64, &'static str, Option<i64>, Option<i64>, Option<&'static str>, i64);

const TRACKS: &[TrackSeed] = &[
    (1, "For Those About To Rock (We Salute You)", Some(1), Some(1), Some("Angus Young, Malcolm Young, Brian Johnson"), 343_719),
    (2, "Balls to the Wall", Some(2), Some(1), None, 342_562),
    (3, "Fast As a Shark", Some(3), Some(1), Some("F. Baltes, S. Kaufman, U. Dirkscneider & W. Hoffman"), 230_619),
    (4, "Restless and Wild", Some(3), Some(1), Some("F. Baltes, R.A. Smith-Diesel, S. Kaufman, U. Dirkscneider & W. Hoffman"), 252_051),
    (5, "Princess of the Dawn", Some(3), Some(1), Some("Deaffy & R.A. Smith-Diesel"), 375_418),
    (6, "Put The Finger On You", Some(1), Some(1), Some("Angus Young, Malcolm Young, Brian Johnson"), 205_662),
    (7, "Let's Get It Up", Some(1), Some(1), Some("Angus Young, Malcolm Young, Brian Johnson"), 233_926),
    (8, "Inject The Venom", Some(1), Some(1), Some("Angus Young, Malcolm Young, Brian Johnson"), 210_834),
    (9, "Go Down", Some(4), Some(1), Some("AC/DC"), 331_180),
    (10, "Dog Eat Dog", Some(4), Some(1), Some("AC/DC"), 215_196),
    (11, "Walk On Water", Some(5), Some(1), Some("Steven Tyler, Joe Perry, Jack Blades, Tommy Shaw"), 295_680),
    (12, "Love In An Elevator", Some(5), Some(1), Some("Steven Tyler, Joe Perry"), 321_828),
    (13, "All I Really Want", Some(6), Some(4), Some("Alanis Morissette & Glenn Ballard"), 284_891),
    (14, "You Oughta Know", Some(6), Some(4), Some("Alanis Morissette & Glenn Ballard"), 249_234),
    (15, "We Die Young", Some(7), Some(1), Some("Jerry Cantrell"), 152_084),
    (16, "Man In The Box", Some(7), Some(1), Some("Jerry Cantrell, Layne Staley"), 286_641),
    (17, "Desafinado", Some(8), Some(2), None, 185_338),
    (18, "Garota De Ipanema", Some(8), Some(2), None, 285_048),
    (19, "Enter Sandman", Some(9), Some(3), Some("Apocalyptica"), 221_701),
    (20, "Master Of Puppets", Some(9), Some(3), Some("Apocalyptica"), 436_453),
    (21, "Cochise", Some(10), Some(1), Some("Audioslave/Chris Cornell"), 222_380),
    (22, "Show Me How to Live", Some(10), Some(1), Some("Audioslave/Chris Cornell"), 277_890),
    (23, "Untitled Demo", None, None, None, 61_000),
];

const PLAYLISTS: &[(i64, &str, &[i64])] = &[
    (1, "Music", &[1, 2, 3, 6, 11, 15, 19, 21]),
    (2, "Grunge", &[15, 16, 22]),
    (3, "Heavy Metal Classic", &[3, 19, 20]),
    (4, "Audiobooks", &[]),
];

/// (id, first, last, title, reports_to, email)
type EmployeeSeed = (i64, &'static str, &'static str, &'static str, Option<i64>, &'static str);

const EMPLOYEES: &[EmployeeSeed] = &[
    (1, "Andrew", "Adams", "General Manager", None, "andrew@chinookcorp.com"),
    (2, "Nancy", "Edwards", "Sales Manager", Some(1), "nancy@chinookcorp.com"),
    (3, "Jane", "Peacock", "Sales Support Agent", Some(2), "jane@chinookcorp.com"),
    (4, "Margaret", "Park", "Sales Support Agent", Some(2), "margaret@chinookcorp.com"),
    (5, "Steve", "Johnson", "Sales Support Agent", Some(2), "steve@chinookcorp.com"),
    (6, "Michael", "Mitchell", "IT Manager", Some(1), "michael@chinookcorp.com"),
];

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

/// Seed rows for every Chinook resource, keyed by storage names.
pub fn seed(registry: &Registry) -> Result<Tables, EngineError> {
    let mut tables = Tables::new();
    for (id, name) in ARTISTS {
        tables.insert(registry, "artists", record(json!({"artist_id": id, "name": name})))?;
    }
    for (id, title, artist) in ALBUMS {
        tables.insert(
            registry,
            "albums",
            record(json!({"album_id": id, "title": title, "artist_id": artist})),
        )?;
    }
    for (id, name) in GENRES {
        tables.insert(registry, "genres", record(json!({"genre_id": id, "name": name})))?;
    }
    for (id, name, album, genre, composer, milliseconds) in TRACKS {
        tables.insert(
            registry,
            "tracks",
            record(json!({
                "track_id": id,
                "name": name,
                "album_id": album,
                "genre_id": genre,
                "composer": composer,
                "milliseconds": milliseconds,
                "bytes": milliseconds * 32,
                "UnitPrice": 0.99,
            })),
        )?;
    }
    for (id, name, members) in PLAYLISTS {
        let playlist = tables.insert(registry, "playlists", record(json!({"playlist_id": id, "name": name})))?;
        for track in *members {
            let track = Identity::single(*track);
            tables.associate(PLAYLIST_TRACK, &[("playlist_id", &playlist), ("track_id", &track)]);
        }
    }
    for (id, first, last, title, reports_to, email) in EMPLOYEES {
        tables.insert(
            registry,
            "employees",
            record(json!({
                "employee_id": id,
                "first_name": first,
                "last_name": last,
                "title": title,
                "email": email,
                "hire_date": "2002-08-14T00:00:00Z",
                "reports_to": reports_to,
                "notes": format!("internal notes for {first}"),
            })),
        )?;
    }
    Ok(tables)
}

/// Engine plus a seeded in-memory store over an allow-all registry.
pub fn demo() -> Result<(Engine, MemoryStore), EngineError> {
    demo_with(registry()?)
}

/// Same as [`demo`] over a caller-built registry (typically one with gates).
pub fn demo_with(registry: Registry) -> Result<(Engine, MemoryStore), EngineError> {
    let registry = Arc::new(registry);
    let tables = seed(&registry)?;
    let store = MemoryStore::with_tables(Arc::clone(&registry), tables);
    Ok((Engine::new(registry), store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_validates() {
        let registry = registry().unwrap();
        assert_eq!(registry.resources().count(), 6);
        let tracks = registry.require("tracks").unwrap();
        assert_eq!(tracks.find_field("unit_price").unwrap().storage_key(), "UnitPrice");
    }

    #[test]
    fn seed_fills_every_table() {
        let registry = registry().unwrap();
        let tables = seed(&registry).unwrap();
        assert_eq!(tables.len("artists"), ARTISTS.len());
        assert_eq!(tables.len("albums"), 10);
        assert_eq!(tables.len("tracks"), TRACKS.len());
        assert_eq!(tables.len("employees"), EMPLOYEES.len());
        let grunge = tables.get("playlists", &Identity::single(2)).unwrap();
        assert_eq!(grunge["name"], json!("Grunge"));
        let playlist_rows = tables
            .association_tables()
            .find(|(table, _)| table.as_str() == PLAYLIST_TRACK)
            .map_or(0, |(_, rows)| rows.len());
        assert_eq!(playlist_rows, 14);
    }
}
