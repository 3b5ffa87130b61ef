use crate::codec::{BinaryReader, BinaryWriter};
use crate::command::{ClientCommand, CommandFactory, TurnCommand};
use crate::error::{CodecError, ProtocolError};

/// Commands finalized by the server for one command step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Turn {
    pub commands: Vec<TurnCommand>,
}

impl Turn {
    pub fn new(commands: Vec<TurnCommand>) -> Self {
        Self { commands }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn write(&self, w: &mut BinaryWriter) -> Result<(), CodecError> {
        let count = u16::try_from(self.commands.len())
            .map_err(|_| CodecError::LengthOverflow(self.commands.len()))?;
        w.write_u16(count);
        for command in &self.commands {
            command.write(w)?;
        }
        Ok(())
    }

    pub fn read(r: &mut BinaryReader<'_>) -> Result<Self, CodecError> {
        let count = r.read_u16()? as usize;
        let mut commands = Vec::with_capacity(count);
        for _ in 0..count {
            commands.push(TurnCommand::read(r)?);
        }
        Ok(Self { commands })
    }

    pub fn decode(&self, factory: &CommandFactory) -> Result<ClientTurn, ProtocolError> {
        let commands = self
            .commands
            .iter()
            .map(|c| factory.decode_turn_command(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ClientTurn { commands })
    }
}

/// A turn whose commands have been decoded through a [`CommandFactory`].
#[derive(Debug, Clone, Default)]
pub struct ClientTurn {
    pub commands: Vec<ClientCommand>,
}

impl ClientTurn {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn to_wire(&self) -> Result<Turn, CodecError> {
        let commands = self
            .commands
            .iter()
            .map(ClientCommand::to_wire)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Turn { commands })
    }
}

/// Longest run a single [`EmptyTurns`] may describe.
pub const MAX_EMPTY_RUN: u32 = u16::MAX as u32;

/// `count` consecutive turns without commands, starting at `first_turn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyTurns {
    pub first_turn: u32,
    pub count: u32,
}

impl EmptyTurns {
    pub fn last_turn(&self) -> u32 {
        self.first_turn.saturating_add(self.count.saturating_sub(1))
    }

    pub fn turn_numbers(&self) -> impl Iterator<Item = u32> {
        let first = self.first_turn;
        (0..self.count).map_while(move |offset| first.checked_add(offset))
    }

    /// Turn numbers start at 1 and a run covers between 1 and
    /// [`MAX_EMPTY_RUN`] turns without passing `u32::MAX`.
    pub fn is_valid(&self) -> bool {
        self.first_turn > 0
            && (1..=MAX_EMPTY_RUN).contains(&self.count)
            && self.first_turn.checked_add(self.count - 1).is_some()
    }

    pub fn write(&self, w: &mut BinaryWriter) {
        w.write_u32(self.first_turn);
        w.write_u32(self.count);
    }

    pub fn read(r: &mut BinaryReader<'_>) -> Result<Self, CodecError> {
        let empty = Self {
            first_turn: r.read_u32()?,
            count: r.read_u32()?,
        };
        if !empty.is_valid() {
            return Err(CodecError::InvalidTurnRange {
                first_turn: empty.first_turn,
                count: empty.count,
            });
        }
        Ok(empty)
    }
}

/// What a server emits after finalizing turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnMessage {
    Turn { number: u32, turn: Turn },
    Empty(EmptyTurns),
}

impl TurnMessage {
    pub fn first_turn(&self) -> u32 {
        match self {
            TurnMessage::Turn { number, .. } => *number,
            TurnMessage::Empty(empty) => empty.first_turn,
        }
    }

    pub fn last_turn(&self) -> u32 {
        match self {
            TurnMessage::Turn { number, .. } => *number,
            TurnMessage::Empty(empty) => empty.last_turn(),
        }
    }

    /// Expands back into one `(number, turn)` pair per step.
    pub fn expand(self) -> Vec<(u32, Turn)> {
        match self {
            TurnMessage::Turn { number, turn } => vec![(number, turn)],
            TurnMessage::Empty(empty) => empty
                .turn_numbers()
                .map(|number| (number, Turn::default()))
                .collect(),
        }
    }
}

/// Collapses runs of consecutive empty turns into [`EmptyTurns`] entries of
/// at most [`MAX_EMPTY_RUN`] turns.
pub fn compress_turns<I>(turns: I) -> Vec<TurnMessage>
where
    I: IntoIterator<Item = (u32, Turn)>,
{
    let mut out: Vec<TurnMessage> = Vec::new();
    for (number, turn) in turns {
        if !turn.is_empty() {
            out.push(TurnMessage::Turn { number, turn });
            continue;
        }
        match out.last_mut() {
            Some(TurnMessage::Empty(run))
                if run.count < MAX_EMPTY_RUN
                    && run.first_turn.checked_add(run.count) == Some(number) =>
            {
                run.count += 1;
            }
            _ => out.push(TurnMessage::Empty(EmptyTurns {
                first_turn: number,
                count: 1,
            })),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: u32) -> TurnCommand {
        TurnCommand {
            id,
            player: 0,
            type_code: 1,
            payload: vec![id as u8],
        }
    }

    #[test]
    fn idle_steps_compress_to_one_entry() {
        let turns = (1..=5).map(|n| (n, Turn::default()));
        let compressed = compress_turns(turns);
        assert_eq!(
            compressed,
            vec![TurnMessage::Empty(EmptyTurns {
                first_turn: 1,
                count: 5
            })]
        );

        let expanded = compressed.into_iter().flat_map(TurnMessage::expand).collect::<Vec<_>>();
        assert_eq!(expanded.len(), 5);
        assert!(expanded.iter().all(|(_, t)| t.is_empty()));
        assert_eq!(
            expanded.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn commands_split_empty_runs() {
        let turns = vec![
            (1, Turn::default()),
            (2, Turn::default()),
            (3, Turn::new(vec![command(1)])),
            (4, Turn::default()),
        ];
        let compressed = compress_turns(turns);
        assert_eq!(compressed.len(), 3);
        assert_eq!(compressed[0].last_turn(), 2);
        assert_eq!(compressed[1].first_turn(), 3);
        assert_eq!(
            compressed[2],
            TurnMessage::Empty(EmptyTurns {
                first_turn: 4,
                count: 1
            })
        );
    }

    #[test]
    fn gaps_start_a_new_run() {
        let compressed = compress_turns(vec![(1, Turn::default()), (3, Turn::default())]);
        assert_eq!(compressed.len(), 2);
    }

    #[test]
    fn long_idle_stretches_split_into_bounded_runs() {
        let turns = (1..=MAX_EMPTY_RUN + 10).map(|n| (n, Turn::default()));
        let compressed = compress_turns(turns);
        assert_eq!(
            compressed,
            vec![
                TurnMessage::Empty(EmptyTurns {
                    first_turn: 1,
                    count: MAX_EMPTY_RUN
                }),
                TurnMessage::Empty(EmptyTurns {
                    first_turn: MAX_EMPTY_RUN + 1,
                    count: 10
                }),
            ]
        );
    }

    #[test]
    fn empty_runs_outside_the_turn_range_are_malformed() {
        let bad = [
            (u32::MAX, 2),
            (1, 0),
            (0, 3),
            (1, MAX_EMPTY_RUN + 1),
            (1, u32::MAX),
        ];
        for (first_turn, count) in bad {
            let mut w = BinaryWriter::new();
            EmptyTurns { first_turn, count }.write(&mut w);
            assert_eq!(
                EmptyTurns::read(&mut BinaryReader::new(w.as_slice())),
                Err(CodecError::InvalidTurnRange { first_turn, count })
            );
        }

        let last = EmptyTurns {
            first_turn: u32::MAX,
            count: 1,
        };
        assert!(last.is_valid());
        assert_eq!(last.last_turn(), u32::MAX);
        assert_eq!(last.turn_numbers().count(), 1);
    }

    #[test]
    fn turn_wire_format() {
        let turn = Turn::new(vec![command(1), command(2)]);
        let mut w = BinaryWriter::new();
        turn.write(&mut w).unwrap();
        // count + 2 * (id, player, type, len, 1 byte payload)
        assert_eq!(w.len(), 2 + 2 * (4 + 1 + 1 + 2 + 1));
        let read = Turn::read(&mut BinaryReader::new(w.as_slice())).unwrap();
        assert_eq!(read, turn);
    }
}
