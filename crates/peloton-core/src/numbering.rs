use crate::normalize::{clean_club_name, comparison_key, NormalizedEntrant};
use crate::CyclistId;

/// Assigns entry numbers to entrants the source published without one.
///
/// Members of the organizing club come first, then everyone else; each group
/// is ordered by club, last name, first name and finally id, so the result
/// does not depend on the order rows appeared in the page.
pub fn estimate_numbers(
    entrants: &[NormalizedEntrant],
    organizer_club: Option<&str>,
) -> Vec<(CyclistId, u32)> {
    let organizer_key = organizer_club
        .map(|club| comparison_key(&clean_club_name(club)))
        .filter(|key| !key.is_empty());

    let (mut organizer, mut others): (Vec<&NormalizedEntrant>, Vec<&NormalizedEntrant>) =
        entrants.iter().partition(|entrant| {
            organizer_key
                .as_deref()
                .is_some_and(|key| entrant.club_key == key)
        });

    organizer.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    others.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    organizer
        .into_iter()
        .chain(others)
        .zip(1u32..)
        .map(|(entrant, number)| (entrant.cyclist_id.clone(), number))
        .collect()
}

fn sort_key(entrant: &NormalizedEntrant) -> (&str, &str, &str, &CyclistId) {
    (
        &entrant.club_key,
        &entrant.last_key,
        &entrant.first_key,
        &entrant.cyclist_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::RawRow;

    fn entrant(id: &str, last: &str, first: &str, club: &str) -> NormalizedEntrant {
        normalize(&RawRow {
            id: id.into(),
            last_name: last.into(),
            first_name: first.into(),
            club: club.into(),
            ..RawRow::default()
        })
        .expect("valid entrant")
    }

    fn field() -> Vec<NormalizedEntrant> {
        vec![
            entrant("4", "Martin", "Luc", "VC Angers"),
            entrant("1", "Bernard", "Paul", "UC Cholet"),
            entrant("3", "Abadie", "Hugo", "VC Angers"),
            entrant("2", "Durand", "Theo", "AC Laval"),
        ]
    }

    #[test]
    fn organizer_club_is_numbered_first() {
        let numbers = estimate_numbers(&field(), Some("5244197 VC ANGERS"));
        let ids: Vec<_> = numbers.iter().map(|(id, n)| (id.as_str(), *n)).collect();
        assert_eq!(ids, vec![("3", 1), ("4", 2), ("2", 3), ("1", 4)]);
    }

    #[test]
    fn numbering_is_independent_of_input_order() {
        let forward = estimate_numbers(&field(), Some("UC Cholet"));
        let mut reversed_field = field();
        reversed_field.reverse();
        let mut reversed = estimate_numbers(&reversed_field, Some("UC Cholet"));

        let mut forward_sorted = forward.clone();
        forward_sorted.sort();
        reversed.sort();
        assert_eq!(forward_sorted, reversed);
        assert_eq!(forward[0].0.as_str(), "1");
    }

    #[test]
    fn unknown_organizer_numbers_everyone_by_club() {
        let numbers = estimate_numbers(&field(), None);
        let order: Vec<_> = numbers.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(order, vec!["2", "1", "3", "4"]);
    }
}
