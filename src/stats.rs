use std::collections::HashSet;

use chrono::{Local, TimeZone};
use serde::Serialize;

use crate::geo::{haversine_km, Located};
use crate::visits::Visit;

const COUNTRY_PALETTE: [&str; 10] = [
    "#ef4444", "#f59e0b", "#10b981", "#3b82f6", "#8b5cf6", "#ec4899", "#06b6d4", "#f97316",
    "#84cc16", "#6366f1",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceCount {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MostVisited {
    pub city: Option<PlaceCount>,
    pub country: Option<PlaceCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountryStat {
    pub name: String,
    pub count: usize,
    pub cities: usize,
    pub color: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    #[serde(flatten)]
    pub visit: Visit,
    pub formatted_date: String,
    pub formatted_time: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TravelSummary {
    pub places: usize,
    pub countries: usize,
    pub cities: usize,
    pub total_distance_km: f64,
    pub total_distance_label: String,
    pub most_visited: MostVisited,
    pub countries_breakdown: Vec<CountryStat>,
}

pub fn total_distance_km(visits: &[Visit]) -> f64 {
    if visits.len() < 2 {
        return 0.0;
    }
    let mut ordered: Vec<&Visit> = visits.iter().collect();
    ordered.sort_by_key(|visit| visit.timestamp);
    ordered
        .windows(2)
        .map(|pair| haversine_km(pair[0].coordinate(), pair[1].coordinate()))
        .sum()
}

pub fn format_distance(km: f64) -> String {
    if km < 1.0 {
        format!("{}m", (km * 1000.0).round() as i64)
    } else if km < 10.0 {
        format!("{km:.1}km")
    } else if km < 1000.0 {
        format!("{}km", km.round() as i64)
    } else {
        format!("{:.1}k km", km / 1000.0)
    }
}

pub fn unique_countries(visits: &[Visit]) -> usize {
    visits
        .iter()
        .map(|visit| visit.country.as_str())
        .collect::<HashSet<_>>()
        .len()
}

pub fn unique_cities(visits: &[Visit]) -> usize {
    visits
        .iter()
        .map(|visit| visit.city.as_str())
        .collect::<HashSet<_>>()
        .len()
}

pub fn most_visited(visits: &[Visit]) -> MostVisited {
    MostVisited {
        city: top_by_count(visits.iter().map(|visit| visit.city.as_str())),
        country: top_by_count(visits.iter().map(|visit| visit.country.as_str())),
    }
}

pub fn country_stats(visits: &[Visit]) -> Vec<CountryStat> {
    let mut groups: Vec<(&str, usize, HashSet<&str>)> = Vec::new();
    for visit in visits {
        match groups.iter_mut().find(|(name, _, _)| *name == visit.country) {
            Some((_, count, cities)) => {
                *count += 1;
                cities.insert(visit.city.as_str());
            }
            None => {
                let mut cities = HashSet::new();
                cities.insert(visit.city.as_str());
                groups.push((visit.country.as_str(), 1, cities));
            }
        }
    }

    let mut stats: Vec<CountryStat> = groups
        .into_iter()
        .map(|(name, count, cities)| CountryStat {
            name: name.to_string(),
            count,
            cities: cities.len(),
            color: country_color(name),
        })
        .collect();
    stats.sort_by(|a, b| b.count.cmp(&a.count));
    stats
}

pub fn timeline(visits: &[Visit]) -> Vec<TimelineEntry> {
    timeline_in(visits, &Local)
}

pub fn timeline_in<Tz>(visits: &[Visit], tz: &Tz) -> Vec<TimelineEntry>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let mut ordered: Vec<&Visit> = visits.iter().collect();
    ordered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    ordered
        .into_iter()
        .map(|visit| {
            let local = visit.timestamp.with_timezone(tz);
            TimelineEntry {
                formatted_date: local.format("%b %-d, %Y").to_string(),
                formatted_time: local.format("%I:%M %p").to_string(),
                visit: visit.clone(),
            }
        })
        .collect()
}

pub fn summarize(visits: &[Visit]) -> TravelSummary {
    let total = total_distance_km(visits);
    TravelSummary {
        places: visits.len(),
        countries: unique_countries(visits),
        cities: unique_cities(visits),
        total_distance_km: total,
        total_distance_label: format_distance(total),
        most_visited: most_visited(visits),
        countries_breakdown: country_stats(visits),
    }
}

pub fn country_color(name: &str) -> &'static str {
    // 31x string hash over UTF-16 units, with the shift wrapping at 32 bits.
    let mut hash: i64 = 0;
    for unit in name.encode_utf16() {
        let shifted = (hash as i32).wrapping_shl(5) as i64;
        hash = unit as i64 + (shifted - hash);
    }
    let index = (hash.unsigned_abs() % COUNTRY_PALETTE.len() as u64) as usize;
    COUNTRY_PALETTE[index]
}

fn top_by_count<'a>(names: impl Iterator<Item = &'a str>) -> Option<PlaceCount> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for name in names {
        match counts.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, count)) => *count += 1,
            None => counts.push((name, 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (name, count) in counts {
        if best.map(|(_, top)| count > top).unwrap_or(true) {
            best = Some((name, count));
        }
    }
    best.map(|(name, count)| PlaceCount {
        name: name.to_string(),
        count,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::visits::VisitMethod;

    fn visit(id: &str, lat: f64, lng: f64, city: &str, country: &str, ts: DateTime<Utc>) -> Visit {
        Visit {
            id: id.into(),
            user_id: "user-1".into(),
            lat,
            lng,
            city: city.into(),
            state: "Unknown".into(),
            country: country.into(),
            formatted: format!("{city}, {country}"),
            method: VisitMethod::Gps,
            timestamp: ts,
            created_at: ts,
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, hour, 4, 0).unwrap()
    }

    fn nigeria() -> Vec<Visit> {
        vec![
            visit("1", 9.0579, 7.4951, "Abuja", "Nigeria", at(10)),
            visit("2", 6.5244, 3.3792, "Lagos", "Nigeria", at(15)),
        ]
    }

    #[test]
    fn formats_distances_by_magnitude() {
        assert_eq!(format_distance(0.999), "999m");
        assert_eq!(format_distance(0.0), "0m");
        assert_eq!(format_distance(1.5), "1.5km");
        assert_eq!(format_distance(500.0), "500km");
        assert_eq!(format_distance(1500.0), "1.5k km");
        assert_eq!(format_distance(12_345.0), "12.3k km");
    }

    #[test]
    fn total_distance_needs_two_visits() {
        assert_eq!(total_distance_km(&[]), 0.0);
        assert_eq!(total_distance_km(&nigeria()[..1]), 0.0);
    }

    #[test]
    fn total_distance_ignores_input_order() {
        let mut visits = nigeria();
        visits.push(visit("3", 4.8156, 7.0498, "Port Harcourt", "Nigeria", at(20)));
        let sorted = total_distance_km(&visits);

        let shuffled = vec![visits[2].clone(), visits[0].clone(), visits[1].clone()];
        assert!((total_distance_km(&shuffled) - sorted).abs() < 1e-9);

        let expected = haversine_km(visits[0].coordinate(), visits[1].coordinate())
            + haversine_km(visits[1].coordinate(), visits[2].coordinate());
        assert!((sorted - expected).abs() < 1e-9);
    }

    #[test]
    fn summarizes_single_country_trip() {
        let summary = summarize(&nigeria());
        assert_eq!(summary.places, 2);
        assert_eq!(summary.countries, 1);
        assert_eq!(summary.cities, 2);
        assert_eq!(
            summary.most_visited.country,
            Some(PlaceCount {
                name: "Nigeria".into(),
                count: 2
            })
        );
        assert_eq!(summary.countries_breakdown.len(), 1);
        assert_eq!(summary.countries_breakdown[0].cities, 2);
        assert_eq!(summary.total_distance_label, "534km");
    }

    #[test]
    fn most_visited_ties_go_to_first_seen() {
        let visits = vec![
            visit("1", 48.85, 2.35, "Paris", "France", at(1)),
            visit("2", 51.50, -0.12, "London", "United Kingdom", at(2)),
            visit("3", 51.51, -0.13, "London", "United Kingdom", at(3)),
            visit("4", 48.86, 2.36, "Paris", "France", at(4)),
        ];
        let top = most_visited(&visits);
        assert_eq!(top.city.unwrap().name, "Paris");
        assert_eq!(top.country.unwrap().name, "France");
        assert_eq!(most_visited(&[]), MostVisited { city: None, country: None });
    }

    #[test]
    fn country_stats_sorted_by_count() {
        let visits = vec![
            visit("1", 48.85, 2.35, "Paris", "France", at(1)),
            visit("2", 9.05, 7.49, "Abuja", "Nigeria", at(2)),
            visit("3", 6.52, 3.37, "Lagos", "Nigeria", at(3)),
            visit("4", 6.53, 3.38, "Lagos", "Nigeria", at(4)),
        ];
        let stats = country_stats(&visits);
        assert_eq!(stats[0].name, "Nigeria");
        assert_eq!(stats[0].count, 3);
        assert_eq!(stats[0].cities, 2);
        assert_eq!(stats[1].name, "France");
        assert_eq!(stats[1].color, country_color("France"));
    }

    #[test]
    fn country_colors_are_stable() {
        assert_eq!(country_color("Nigeria"), COUNTRY_PALETTE[7]);
        assert_eq!(country_color("France"), COUNTRY_PALETTE[5]);
        assert_eq!(country_color("United States"), COUNTRY_PALETTE[9]);
        assert_eq!(country_color(""), COUNTRY_PALETTE[0]);
        assert_eq!(country_color("Côte d’Ivoire"), COUNTRY_PALETTE[1]);
    }

    #[test]
    fn timeline_is_newest_first_with_formatted_stamps() {
        let entries = timeline_in(&nigeria(), &Utc);
        assert_eq!(entries[0].visit.city, "Lagos");
        assert_eq!(entries[0].formatted_date, "Jan 5, 2024");
        assert_eq!(entries[0].formatted_time, "03:04 PM");
        assert_eq!(entries[1].formatted_time, "10:04 AM");
    }
}
